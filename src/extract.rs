//! Multi-format text extraction for the document folder.
//!
//! The format is chosen from the lowercase file extension. Supported formats
//! return `Ok(Some(text))`; unsupported extensions return `Ok(None)` and are
//! skipped by the caller without being treated as a failure. A failing file
//! yields an [`ExtractError`] and the caller drops only that file.

use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Per-file extraction failure. Never fatal for a refresh cycle.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("file is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Document formats recognised by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pdf,
    Docx,
    Xlsx,
    Text,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Format::Pdf),
            "docx" => Some(Format::Docx),
            "xlsx" => Some(Format::Xlsx),
            "txt" | "md" => Some(Format::Text),
            _ => None,
        }
    }
}

/// Reads `path` and extracts its plain text.
pub fn extract_file(path: &Path) -> Result<Option<String>, ExtractError> {
    let Some(format) = Format::from_path(path) else {
        return Ok(None);
    };
    let bytes = std::fs::read(path)?;
    extract_bytes(&bytes, format).map(Some)
}

/// Extracts plain text from in-memory file content of a known format.
pub fn extract_bytes(bytes: &[u8], format: Format) -> Result<String, ExtractError> {
    match format {
        Format::Pdf => extract_pdf(bytes),
        Format::Docx => extract_docx(bytes),
        Format::Xlsx => extract_xlsx(bytes),
        Format::Text => Ok(String::from_utf8(bytes.to_vec())?),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed inputs; keep that contained to this file.
    let raw = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| ExtractError::Pdf("parser panicked".to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let pages: Vec<String> = raw
        .split('\u{c}')
        .map(normalize_pdf_text)
        .filter(|p| !p.is_empty())
        .collect();
    Ok(pages.join("\n"))
}

fn hyphen_break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)-\n(\w+)").expect("static regex"))
}

fn broken_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([a-zA-Z])- ([a-zA-Z])").expect("static regex"))
}

/// Cleans up the text of one PDF page.
///
/// Trailing whitespace is trimmed from every line, words hyphenated across a
/// line break are rejoined (`word-\nword` becomes `wordword`), and words
/// broken as `letter- letter` are glued back together.
pub fn normalize_pdf_text(page: &str) -> String {
    let trimmed: Vec<&str> = page.trim().lines().map(str::trim_end).collect();
    let joined = trimmed.join("\n");
    let rejoined = hyphen_break_re().replace_all(&joined, "$1$2");
    broken_word_re().replace_all(&rejoined, "$1$2").into_owned()
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry.take(max_bytes).read_to_end(&mut out)?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn open_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    docx_paragraphs(&doc_xml)
}

/// Collects `w:t` runs, one output line per `w:p` paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
        read_shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let mut lines: Vec<String> = Vec::new();
    for name in worksheet_names(&archive).into_iter().take(XLSX_MAX_SHEETS) {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        lines.extend(sheet_rows(&sheet_xml, &shared_strings)?);
    }
    Ok(lines.join("\n"))
}

/// Each `<si>` becomes one string; rich-text runs inside it are concatenated.
fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn worksheet_names(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Cell type as given by the `t` attribute of `<c>`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Shared,
    Inline,
    Bool,
    Plain,
}

/// Renders a sheet as one line per `<row>`, non-empty cells joined by a space.
fn sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut kind = CellKind::Plain;
    let mut in_value = false;
    let mut cell_count = 0usize;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    kind = CellKind::Plain;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"t" {
                            kind = match attr.value.as_ref() {
                                b"s" => CellKind::Shared,
                                b"inlineStr" => CellKind::Inline,
                                b"b" => CellKind::Bool,
                                _ => CellKind::Plain,
                            };
                        }
                    }
                }
                b"v" => in_value = true,
                b"t" if kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                let rendered = match kind {
                    CellKind::Shared => s
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared_strings.get(i).cloned()),
                    CellKind::Bool => Some(if s == "1" { "true" } else { "false" }.to_string()),
                    CellKind::Inline | CellKind::Plain => Some(s.to_string()),
                };
                if let Some(text) = rendered.filter(|t| !t.is_empty()) {
                    row.push(text);
                    cell_count += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" "));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn unsupported_extension_is_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("image.png");
        std::fs::write(&path, b"\x89PNG").unwrap();
        assert!(extract_file(&path).unwrap().is_none());
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        assert_eq!(Format::from_path(Path::new("a/Report.PDF")), Some(Format::Pdf));
        assert_eq!(Format::from_path(Path::new("notes.Md")), Some(Format::Text));
        assert_eq!(Format::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_bytes(b"not a pdf", Format::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_bytes(b"not a zip", Format::Docx).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn invalid_utf8_text_returns_error() {
        let err = extract_bytes(&[0xff, 0xfe, 0x00], Format::Text).unwrap_err();
        assert!(matches!(err, ExtractError::Encoding(_)));
    }

    #[test]
    fn pdf_normalization_rejoins_hyphenated_words() {
        assert_eq!(normalize_pdf_text("infor-\nmation"), "information");
        assert_eq!(normalize_pdf_text("data- base design"), "database design");
        assert_eq!(normalize_pdf_text("  line one   \nline two  \n\n"), "line one\nline two");
    }

    #[test]
    fn pdf_normalization_keeps_plain_dashes() {
        assert_eq!(normalize_pdf_text("well-known fact"), "well-known fact");
        assert_eq!(normalize_pdf_text("2019 - 2020"), "2019 - 2020");
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let xml = r#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t>Refund </w:t></w:r><w:r><w:t>policy</w:t></w:r></w:p><w:p><w:r><w:t>Thirty days &amp; receipt</w:t></w:r></w:p></w:body></w:document>"#;
        let bytes = zip_of(&[("word/document.xml", xml)]);
        let text = extract_bytes(&bytes, Format::Docx).unwrap();
        assert_eq!(text, "Refund policy\nThirty days & receipt");
    }

    #[test]
    fn docx_without_document_xml_is_error() {
        let bytes = zip_of(&[("word/other.xml", "<x/>")]);
        assert!(matches!(
            extract_bytes(&bytes, Format::Docx),
            Err(ExtractError::Ooxml(_))
        ));
    }

    #[test]
    fn xlsx_rows_render_shared_inline_and_numeric_cells() {
        let shared = r#"<sst><si><t>Name</t></si><si><r><t>Ali</t></r><r><t>ce</t></r></si></sst>"#;
        let sheet1 = r#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="inlineStr"><is><t>Age</t></is></c></row>
            <row r="2"><c r="A2" t="s"><v>1</v></c><c r="B2"><v>42</v></c><c r="C2" t="b"><v>1</v></c></row>
        </sheetData></worksheet>"#;
        let sheet2 = r#"<worksheet><sheetData><row r="1"><c r="A1"><v>3.5</v></c></row></sheetData></worksheet>"#;
        let bytes = zip_of(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet2.xml", sheet2),
            ("xl/worksheets/sheet1.xml", sheet1),
        ]);
        let text = extract_bytes(&bytes, Format::Xlsx).unwrap();
        assert_eq!(text, "Name Age\nAlice 42 true\n3.5");
    }

    #[test]
    fn xlsx_without_shared_strings_still_extracts() {
        let sheet = r#"<worksheet><sheetData><row><c><v>7</v></c></row></sheetData></worksheet>"#;
        let bytes = zip_of(&[("xl/worksheets/sheet1.xml", sheet)]);
        assert_eq!(extract_bytes(&bytes, Format::Xlsx).unwrap(), "7");
    }
}
