//! Structured decision protocol with the model.
//!
//! Before answering a turn the model is asked for a strict JSON decision:
//!
//! ```json
//! { "search_needed": true, "search_query": "refund policy", "assistant_reply": null }
//! ```
//!
//! The exchange is a small state machine:
//!
//! ```text
//!            ┌──────────── transport error / timeout ───────────┐
//!            ▼                                                  │
//!        Request ──reply──▶ Validate ──valid──▶ Accepted        │
//!          │  ▲                │                                │
//!          │  └── Correct ◀────┘ invalid                        │
//!          └── attempts spent ──▶ Exhausted ◀───────────────────┘
//! ```
//!
//! Each `Request` spends one attempt. An invalid reply is echoed back as the
//! assistant turn followed by a correction instruction, so the model sees its
//! own mistake. Transport failures spend an attempt without growing the
//! transcript. The loop makes at most `max_attempts` model calls whatever the
//! model replies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::llm::{ChatBackend, ModelError};
use crate::models::{ChatMessage, NegotiationDecision};
use crate::synthesis::{BACKEND_UNREACHABLE_MESSAGE, PROTOCOL_FAILED_MESSAGE};

/// System instruction opening every negotiation transcript.
pub const DECISION_INSTRUCTION: &str = "You are a strict decision assistant. Reply ONLY with a JSON object \
with exactly these keys: search_needed (bool), search_query (string|null), assistant_reply (string|null). \
Set search_needed to true when answering requires searching the user's documents, and put the search terms \
in search_query. Otherwise answer directly in assistant_reply. No text outside JSON.";

/// Correction sent after a reply that is not JSON at all.
pub const INVALID_JSON_CORRECTION: &str =
    "Your last reply was invalid JSON. Reply ONLY with valid decision JSON.";

const FIELDS: [&str; 3] = ["search_needed", "search_query", "assistant_reply"];

/// Why a reply was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    MalformedJson(String),
    NotAnObject,
    MissingField(&'static str),
    UnexpectedField(String),
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::MalformedJson(e) => write!(f, "malformed JSON: {}", e),
            InvalidReason::NotAnObject => write!(f, "the reply must be a JSON object"),
            InvalidReason::MissingField(field) => write!(f, "missing key `{}`", field),
            InvalidReason::UnexpectedField(field) => write!(f, "unexpected key `{}`", field),
            InvalidReason::WrongType { field, expected } => {
                write!(f, "`{}` must be {}", field, expected)
            }
        }
    }
}

impl InvalidReason {
    /// The system message that asks the model to fix this problem.
    pub fn correction(&self) -> String {
        match self {
            InvalidReason::MalformedJson(_) => INVALID_JSON_CORRECTION.to_string(),
            other => format!(
                "Your last reply was not a valid decision JSON ({}). Reply ONLY with valid JSON with \
                 exactly the keys search_needed (bool), search_query (string|null), assistant_reply (string|null).",
                other
            ),
        }
    }
}

/// Result of checking one raw model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid(NegotiationDecision),
    Invalid(InvalidReason),
}

/// Checks a raw reply against the decision format.
///
/// Only surrounding whitespace is tolerated. The reply must be a JSON object
/// with exactly the three decision keys: `search_needed` a boolean and the
/// other two each a string or `null`.
pub fn validate_decision(raw: &str) -> Validation {
    let value: Value = match serde_json::from_str(raw.trim()) {
        Ok(v) => v,
        Err(e) => return Validation::Invalid(InvalidReason::MalformedJson(e.to_string())),
    };
    let Value::Object(map) = value else {
        return Validation::Invalid(InvalidReason::NotAnObject);
    };
    match decision_from_object(&map) {
        Ok(decision) => Validation::Valid(decision),
        Err(reason) => Validation::Invalid(reason),
    }
}

fn decision_from_object(map: &Map<String, Value>) -> Result<NegotiationDecision, InvalidReason> {
    if let Some(extra) = map.keys().find(|k| !FIELDS.contains(&k.as_str())) {
        return Err(InvalidReason::UnexpectedField(extra.clone()));
    }

    let search_needed = match map.get("search_needed") {
        None => return Err(InvalidReason::MissingField("search_needed")),
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(InvalidReason::WrongType {
                field: "search_needed",
                expected: "a boolean",
            })
        }
    };

    Ok(NegotiationDecision {
        search_needed,
        search_query: nullable_string(map, "search_query")?,
        assistant_reply: nullable_string(map, "assistant_reply")?,
    })
}

fn nullable_string(
    map: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, InvalidReason> {
    match map.get(field) {
        None => Err(InvalidReason::MissingField(field)),
        Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(InvalidReason::WrongType {
            field,
            expected: "a string or null",
        }),
    }
}

/// States of the decision exchange.
#[derive(Debug)]
enum NegotiationState {
    Request,
    Validate(String),
    Correct { raw: String, reason: InvalidReason },
    Accepted(NegotiationDecision),
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStatus {
    Accepted,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOutcome {
    pub decision: NegotiationDecision,
    /// Model calls made, including failed ones.
    pub attempts: u32,
    pub status: NegotiationStatus,
}

/// Runs the decision protocol against a chat backend.
pub struct Negotiator {
    backend: Arc<dyn ChatBackend>,
    max_attempts: u32,
    call_timeout: Duration,
}

impl Negotiator {
    pub fn new(backend: Arc<dyn ChatBackend>, max_attempts: u32, call_timeout: Duration) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
            call_timeout,
        }
    }

    pub async fn negotiate(&self, question: &str) -> NegotiationOutcome {
        let mut transcript = vec![
            ChatMessage::system(DECISION_INSTRUCTION),
            ChatMessage::user(question),
        ];
        let mut attempts = 0u32;
        let mut got_reply = false;
        let mut state = NegotiationState::Request;

        loop {
            state = match state {
                NegotiationState::Request if attempts >= self.max_attempts => {
                    NegotiationState::Exhausted
                }
                NegotiationState::Request => {
                    attempts += 1;
                    match self.call(&transcript).await {
                        Ok(raw) => {
                            got_reply = true;
                            NegotiationState::Validate(raw)
                        }
                        Err(e) => {
                            warn!(attempt = attempts, error = %e, "decision request failed");
                            NegotiationState::Request
                        }
                    }
                }
                NegotiationState::Validate(raw) => match validate_decision(&raw) {
                    Validation::Valid(decision) => NegotiationState::Accepted(decision),
                    Validation::Invalid(reason) => {
                        warn!(attempt = attempts, reason = %reason, "invalid decision reply");
                        NegotiationState::Correct { raw, reason }
                    }
                },
                NegotiationState::Correct { raw, reason } => {
                    transcript.push(ChatMessage::assistant(raw));
                    transcript.push(ChatMessage::system(reason.correction()));
                    NegotiationState::Request
                }
                NegotiationState::Accepted(decision) => {
                    debug!(
                        attempts,
                        search_needed = decision.search_needed,
                        "decision accepted"
                    );
                    return NegotiationOutcome {
                        decision,
                        attempts,
                        status: NegotiationStatus::Accepted,
                    };
                }
                NegotiationState::Exhausted => {
                    let message = if got_reply {
                        PROTOCOL_FAILED_MESSAGE
                    } else {
                        BACKEND_UNREACHABLE_MESSAGE
                    };
                    error!(attempts, got_reply, "decision protocol exhausted");
                    return NegotiationOutcome {
                        decision: NegotiationDecision {
                            search_needed: false,
                            search_query: None,
                            assistant_reply: Some(message.to_string()),
                        },
                        attempts,
                        status: NegotiationStatus::Exhausted,
                    };
                }
            };
        }
    }

    async fn call(&self, transcript: &[ChatMessage]) -> Result<String, ModelError> {
        tokio::time::timeout(self.call_timeout, self.backend.chat(transcript))
            .await
            .unwrap_or(Err(ModelError::Timeout(self.call_timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedBackend;
    use crate::models::Role;

    const VALID_SEARCH: &str =
        r#"{"search_needed": true, "search_query": "refund policy", "assistant_reply": null}"#;

    fn negotiator(backend: Arc<ScriptedBackend>, max_attempts: u32) -> Negotiator {
        Negotiator::new(backend, max_attempts, Duration::from_secs(5))
    }

    fn reason(raw: &str) -> InvalidReason {
        match validate_decision(raw) {
            Validation::Invalid(r) => r,
            Validation::Valid(d) => panic!("accepted invalid reply {raw:?} as {d:?}"),
        }
    }

    #[test]
    fn accepts_well_formed_decisions() {
        let Validation::Valid(d) = validate_decision(&format!("  \n{}\n ", VALID_SEARCH)) else {
            panic!("valid decision rejected");
        };
        assert!(d.search_needed);
        assert_eq!(d.query(), Some("refund policy"));

        let Validation::Valid(d) = validate_decision(
            r#"{"assistant_reply": "Hi!", "search_query": null, "search_needed": false}"#,
        ) else {
            panic!("key order must not matter");
        };
        assert_eq!(d.reply(), Some("Hi!"));
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(matches!(reason("Sure! Here you go"), InvalidReason::MalformedJson(_)));
        assert!(matches!(
            reason(&format!("```json\n{}\n```", VALID_SEARCH)),
            InvalidReason::MalformedJson(_)
        ));
        assert!(matches!(
            reason(&format!("Answer: {}", VALID_SEARCH)),
            InvalidReason::MalformedJson(_)
        ));
        assert_eq!(reason("[true, null, null]"), InvalidReason::NotAnObject);
        assert_eq!(reason("\"yes\""), InvalidReason::NotAnObject);
        assert_eq!(
            reason(r#"{"search_needed": true, "search_query": "x"}"#),
            InvalidReason::MissingField("assistant_reply")
        );
        assert_eq!(
            reason(r#"{"search_needed": "true", "search_query": null, "assistant_reply": null}"#),
            InvalidReason::WrongType {
                field: "search_needed",
                expected: "a boolean"
            }
        );
        assert_eq!(
            reason(r#"{"search_needed": 1, "search_query": null, "assistant_reply": null}"#),
            InvalidReason::WrongType {
                field: "search_needed",
                expected: "a boolean"
            }
        );
        assert_eq!(
            reason(r#"{"search_needed": false, "search_query": 42, "assistant_reply": null}"#),
            InvalidReason::WrongType {
                field: "search_query",
                expected: "a string or null"
            }
        );
        assert_eq!(
            reason(r#"{"search_needed": false, "search_query": null, "assistant_reply": null, "confidence": 0.9}"#),
            InvalidReason::UnexpectedField("confidence".to_string())
        );
    }

    #[test]
    fn corrections_distinguish_syntax_from_shape() {
        assert_eq!(reason("{").correction(), INVALID_JSON_CORRECTION);
        let shape = InvalidReason::MissingField("search_query").correction();
        assert!(shape.starts_with("Your last reply was not a valid decision JSON"));
        assert!(shape.contains("search_query"));
    }

    #[tokio::test]
    async fn refund_question_recovers_after_invalid_json() {
        let backend = Arc::new(ScriptedBackend::new([
            "Sure! I will search for the refund policy.",
            VALID_SEARCH,
        ]));
        let outcome = negotiator(backend.clone(), 5)
            .negotiate("What is our refund policy?")
            .await;

        assert_eq!(outcome.status, NegotiationStatus::Accepted);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.decision.search_needed);
        assert_eq!(outcome.decision.query(), Some("refund policy"));

        let calls = backend.calls();
        assert_eq!(calls[0].len(), 2);
        let second = &calls[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].role, Role::Assistant);
        assert_eq!(second[2].content, "Sure! I will search for the refund policy.");
        assert_eq!(second[3].role, Role::System);
        assert_eq!(second[3].content, INVALID_JSON_CORRECTION);
    }

    #[tokio::test]
    async fn adversarial_model_exhausts_within_budget() {
        let garbage = (0..50).map(|i| match i % 5 {
            0 => "not json".to_string(),
            1 => "{}".to_string(),
            2 => r#"{"search_needed": "yes", "search_query": null, "assistant_reply": null}"#.to_string(),
            3 => r#"{"search_needed": true, "search_query": null, "assistant_reply": null, "x": 1}"#.to_string(),
            _ => "[1,2,3]".to_string(),
        });
        for max_attempts in 1..=7 {
            let backend = Arc::new(ScriptedBackend::new(garbage.clone()));
            let outcome = negotiator(backend.clone(), max_attempts).negotiate("hello").await;
            assert_eq!(outcome.status, NegotiationStatus::Exhausted);
            assert_eq!(outcome.attempts, max_attempts);
            assert_eq!(backend.call_count(), max_attempts as usize);
            assert!(!outcome.decision.search_needed);
            assert_eq!(outcome.decision.reply(), Some(PROTOCOL_FAILED_MESSAGE));
        }
    }

    #[tokio::test]
    async fn unreachable_backend_reports_unreachable() {
        let backend = Arc::new(ScriptedBackend::with_results(Vec::new()));
        let outcome = negotiator(backend.clone(), 5).negotiate("hello").await;
        assert_eq!(outcome.status, NegotiationStatus::Exhausted);
        assert_eq!(outcome.decision.reply(), Some(BACKEND_UNREACHABLE_MESSAGE));
        // Transport failures do not grow the transcript.
        assert!(backend.calls().iter().all(|t| t.len() == 2));
        assert_eq!(backend.call_count(), 5);
    }

    #[tokio::test]
    async fn transport_failure_then_valid_reply() {
        let backend = Arc::new(ScriptedBackend::with_results([
            Err(ModelError::Transport("reset".to_string())),
            Ok(VALID_SEARCH.to_string()),
        ]));
        let outcome = negotiator(backend.clone(), 5).negotiate("refunds?").await;
        assert_eq!(outcome.status, NegotiationStatus::Accepted);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(backend.calls()[1].len(), 2);
    }

    #[tokio::test]
    async fn slow_backend_times_out_each_attempt() {
        let backend = Arc::new(ScriptedBackend::hanging(Duration::from_secs(30)));
        let negotiator = Negotiator::new(backend.clone(), 3, Duration::from_millis(20));
        let outcome = negotiator.negotiate("hello").await;
        assert_eq!(outcome.status, NegotiationStatus::Exhausted);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.decision.reply(), Some(BACKEND_UNREACHABLE_MESSAGE));
    }

    #[tokio::test]
    async fn direct_answer_is_accepted_first_try() {
        let backend = Arc::new(ScriptedBackend::new([
            r#"{"search_needed": false, "search_query": null, "assistant_reply": "Hello there!"}"#,
        ]));
        let outcome = negotiator(backend, 5).negotiate("hi").await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.decision.reply(), Some("Hello there!"));
    }
}
