//! CLI command implementations.
//!
//! Each command builds the services it needs from the loaded [`Config`],
//! does one refresh where it needs document content, and prints to stdout.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::{Config, EXAMPLE_CONFIG};
use crate::knowledge::{KnowledgeBase, SearchMode};
use crate::llm::{ChatBackend, OllamaChat};
use crate::synthesis::ChatEngine;

async fn refreshed_knowledge(config: &Config) -> Result<KnowledgeBase> {
    let kb = KnowledgeBase::from_config(config)?;
    kb.refresh().await.with_context(|| {
        format!(
            "Failed to read document folder {}",
            config.files.folder.display()
        )
    })?;
    Ok(kb)
}

/// `docchat refresh`: one full refresh, then the counts.
pub async fn run_refresh(config: &Config) -> Result<()> {
    let kb = KnowledgeBase::from_config(config)?;
    let summary = kb.refresh().await?;
    println!(
        "Refreshed {} files ({} chunks, {} skipped, {} failed).",
        summary.files, summary.chunks, summary.skipped, summary.failed
    );
    Ok(())
}

/// `docchat files`: the files that made it into the cache.
pub async fn run_files(config: &Config) -> Result<()> {
    let kb = refreshed_knowledge(config).await?;
    let files = kb.files();
    for f in &files {
        println!("{}", f);
    }
    println!("{} files.", files.len());
    Ok(())
}

/// `docchat search`: one search strategy, without the model.
pub async fn run_search(config: &Config, query: &str, mode: &str, limit: Option<usize>) -> Result<()> {
    let mode: SearchMode = mode.parse()?;
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let kb = refreshed_knowledge(config).await?;
    let limit = limit.unwrap_or(config.retrieval.top_k);
    let results = kb.search(query, mode, limit).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!("{}. {}", i + 1, r);
    }
    Ok(())
}

/// `docchat ask`: one chat turn against the configured model, not stored.
pub async fn run_ask(config: &Config, question: &str) -> Result<()> {
    if question.trim().is_empty() {
        bail!("question must not be empty");
    }
    let kb = Arc::new(refreshed_knowledge(config).await?);
    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaChat::new(&config.model)?);
    let engine = ChatEngine::new(kb, backend, config);

    let reply = engine.answer_turn(question).await;
    println!(
        "decision: search_needed={} query={} (negotiation attempts: {})",
        reply.decision.search_needed,
        reply.decision.query().unwrap_or("-"),
        reply.attempts
    );
    println!("retrieval: {}", reply.retrieval_kind);
    println!();
    println!("{}", reply.content);
    Ok(())
}

/// `docchat init`: writes the example configuration unless the file exists.
pub fn run_init(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("Config file already exists: {}", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote example config to {}", path.display());
    Ok(())
}
