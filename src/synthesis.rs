//! Reply synthesis for one chat turn.
//!
//! [`ChatEngine`] runs a turn end to end: negotiate a decision, retrieve
//! context if the model asked for a search, then produce the final answer.
//! The answer is always text. Backend failures become one of the marked
//! fallback messages below instead of errors, so callers can store and
//! display it like any other reply.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::knowledge::{KnowledgeBase, Retrieval};
use crate::llm::{ChatBackend, ModelError};
use crate::models::{ChatMessage, NegotiationDecision};
use crate::negotiation::Negotiator;

pub const BACKEND_UNREACHABLE_MESSAGE: &str = "⚠️ Unable to reach backend after retries.";
pub const PROTOCOL_FAILED_MESSAGE: &str = "⚠️ Decision protocol failed after retries.";
pub const TURN_TIMEOUT_MESSAGE: &str = "⚠️ The request took too long and was cancelled.";

/// System instruction for answers grounded in retrieved context.
pub const ANSWER_INSTRUCTION: &str = "You are a helpful assistant answering based ONLY on the \
following context. Do NOT mention documents, excerpts, or context in your answer. Just answer as if \
you knew it directly.";

/// Fixed-delay retry budget for final model calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.synthesis.attempts,
            delay: config.synthesis.retry_delay(),
            call_timeout: config.model.call_timeout(),
        }
    }
}

/// Calls the backend up to `policy.attempts` times, sleeping `policy.delay`
/// between attempts.
///
/// Transport errors, timeouts, and error statuses are all retried. Returns
/// the last error once the budget is spent.
pub async fn retry_with_backoff(
    backend: &dyn ChatBackend,
    messages: &[ChatMessage],
    policy: &RetryPolicy,
) -> Result<String, ModelError> {
    let attempts = policy.attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        let result = tokio::time::timeout(policy.call_timeout, backend.chat(messages))
            .await
            .unwrap_or(Err(ModelError::Timeout(policy.call_timeout)));
        match result {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "model call failed");
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    Err(last_err.unwrap_or_else(|| ModelError::Transport("no attempt was made".to_string())))
}

/// The outcome of one chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    /// Final answer text; never empty.
    pub content: String,
    pub decision: NegotiationDecision,
    /// `"semantic"`, `"lexical"`, or `"none"`.
    pub retrieval_kind: &'static str,
    /// Model calls spent on negotiation.
    pub attempts: u32,
}

pub struct ChatEngine {
    knowledge: Arc<KnowledgeBase>,
    backend: Arc<dyn ChatBackend>,
    negotiator: Negotiator,
    policy: RetryPolicy,
    turn_timeout: Duration,
}

impl ChatEngine {
    pub fn new(knowledge: Arc<KnowledgeBase>, backend: Arc<dyn ChatBackend>, config: &Config) -> Self {
        Self {
            negotiator: Negotiator::new(
                backend.clone(),
                config.negotiation.max_attempts,
                config.model.call_timeout(),
            ),
            knowledge,
            backend,
            policy: RetryPolicy::from_config(config),
            turn_timeout: config.synthesis.request_timeout(),
        }
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    /// Answers one question.
    pub async fn answer(&self, question: &str) -> TurnReply {
        let outcome = self.negotiator.negotiate(question).await;
        let decision = outcome.decision;

        let retrieval = if decision.search_needed {
            let query = decision.query().unwrap_or(question);
            info!(query, "searching documents");
            self.knowledge.retrieve(query).await
        } else {
            Retrieval::Miss
        };

        let content = if let Some(context) = retrieval.context() {
            let messages = [
                ChatMessage::system(ANSWER_INSTRUCTION),
                ChatMessage::system(format!("Context:\n{}", context)),
                ChatMessage::user(question),
            ];
            self.complete(&messages).await
        } else if let Some(reply) = decision.reply() {
            reply.to_string()
        } else {
            self.complete(&[ChatMessage::user(question)]).await
        };

        TurnReply {
            content,
            decision,
            retrieval_kind: retrieval.kind(),
            attempts: outcome.attempts,
        }
    }

    /// Answers one question, giving up after `deadline`.
    ///
    /// On expiry every in-flight model call is dropped and the reply is
    /// [`TURN_TIMEOUT_MESSAGE`].
    pub async fn answer_within(&self, question: &str, deadline: Duration) -> TurnReply {
        match tokio::time::timeout(deadline, self.answer(question)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(?deadline, "chat turn timed out");
                TurnReply {
                    content: TURN_TIMEOUT_MESSAGE.to_string(),
                    decision: NegotiationDecision {
                        search_needed: false,
                        search_query: None,
                        assistant_reply: None,
                    },
                    retrieval_kind: "none",
                    attempts: 0,
                }
            }
        }
    }

    /// Answers one question within the configured turn deadline.
    pub async fn answer_turn(&self, question: &str) -> TurnReply {
        self.answer_within(question, self.turn_timeout).await
    }

    /// Produces a fresh reply to the last message of `history`, as a plain
    /// completion within the turn deadline.
    pub async fn regenerate(&self, history: &[ChatMessage]) -> String {
        match tokio::time::timeout(self.turn_timeout, self.complete(history)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(deadline = ?self.turn_timeout, "regeneration timed out");
                TURN_TIMEOUT_MESSAGE.to_string()
            }
        }
    }

    async fn complete(&self, messages: &[ChatMessage]) -> String {
        match retry_with_backoff(self.backend.as_ref(), messages, &self.policy).await {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => {
                warn!("model returned an empty reply");
                BACKEND_UNREACHABLE_MESSAGE.to_string()
            }
            Err(e) => {
                tracing::error!(error = %e, "model unreachable after retries");
                BACKEND_UNREACHABLE_MESSAGE.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedBackend;
    use crate::models::Role;
    use std::fs;

    fn fast_config(dir: &std::path::Path) -> Config {
        let mut config = Config::minimal(dir);
        config.synthesis.retry_delay_ms = 1;
        config
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    async fn engine(
        dir: &std::path::Path,
        backend: Arc<ScriptedBackend>,
        tweak: impl FnOnce(&mut Config),
    ) -> ChatEngine {
        let mut config = fast_config(dir);
        tweak(&mut config);
        let kb = Arc::new(KnowledgeBase::from_config(&config).unwrap());
        kb.refresh().await.unwrap();
        ChatEngine::new(kb, backend, &config)
    }

    #[tokio::test]
    async fn retry_recovers_after_failures() {
        let backend = ScriptedBackend::with_results([
            Err(ModelError::Transport("reset".into())),
            Err(ModelError::HttpStatus {
                status: reqwest::StatusCode::BAD_GATEWAY,
                snippet: String::new(),
            }),
            Ok("finally".to_string()),
        ]);
        let reply = retry_with_backoff(&backend, &[ChatMessage::user("hi")], &policy(3))
            .await
            .unwrap();
        assert_eq!(reply, "finally");
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn retry_returns_last_error() {
        let backend = ScriptedBackend::with_results([
            Err(ModelError::Transport("first".into())),
            Err(ModelError::Decode("second".into())),
            Ok("too late".to_string()),
        ]);
        let err = retry_with_backoff(&backend, &[ChatMessage::user("hi")], &policy(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Decode(_)));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn refund_question_is_answered_from_documents() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(
            tmp.path().join("policy.txt"),
            "Refund policy: refunds are issued within 30 days of purchase.",
        )
        .unwrap();
        let backend = Arc::new(ScriptedBackend::new([
            "I think you want the refund policy",
            r#"{"search_needed": true, "search_query": "refund policy", "assistant_reply": null}"#,
            "Refunds are issued within 30 days.",
        ]));
        let engine = engine(tmp.path(), backend.clone(), |_| {}).await;

        let reply = engine.answer("What is our refund policy?").await;
        assert_eq!(reply.content, "Refunds are issued within 30 days.");
        assert_eq!(reply.retrieval_kind, "semantic");
        assert_eq!(reply.attempts, 2);
        assert!(reply.decision.search_needed);

        let calls = backend.calls();
        let last = calls.last().unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].content, ANSWER_INSTRUCTION);
        assert!(last[1].content.starts_with("Context:\n..."));
        assert!(last[1].content.contains("30 days"));
        assert_eq!(last[2].role, Role::User);
        assert_eq!(last[2].content, "What is our refund policy?");
    }

    #[tokio::test]
    async fn direct_reply_skips_search_and_synthesis() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new([
            r#"{"search_needed": false, "search_query": null, "assistant_reply": "Hello!"}"#,
        ]));
        let engine = engine(tmp.path(), backend.clone(), |_| {}).await;
        let reply = engine.answer("hi").await;
        assert_eq!(reply.content, "Hello!");
        assert_eq!(reply.retrieval_kind, "none");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn missing_query_searches_with_the_question() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("fox.txt"), "The quick fox jumps.").unwrap();
        let backend = Arc::new(ScriptedBackend::new([
            r#"{"search_needed": true, "search_query": null, "assistant_reply": null}"#,
            "It jumps.",
        ]));
        let engine = engine(tmp.path(), backend.clone(), |c| c.embedding.provider = "disabled".into()).await;
        let reply = engine.answer("what does the fox do").await;
        assert_eq!(reply.retrieval_kind, "lexical");
        assert_eq!(reply.content, "It jumps.");
        assert!(backend.calls()[1][1].content.contains("quick fox"));
    }

    #[tokio::test]
    async fn search_miss_without_reply_uses_plain_completion() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new([
            r#"{"search_needed": true, "search_query": "unicorns", "assistant_reply": "  "}"#,
            "I could not find anything about unicorns.",
        ]));
        let engine = engine(tmp.path(), backend.clone(), |_| {}).await;
        let reply = engine.answer("Tell me about unicorns").await;
        assert_eq!(reply.retrieval_kind, "none");
        assert_eq!(reply.content, "I could not find anything about unicorns.");
        assert_eq!(backend.calls()[1], vec![ChatMessage::user("Tell me about unicorns")]);
    }

    #[tokio::test]
    async fn failed_synthesis_yields_fallback_text() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "alpha beta gamma").unwrap();
        let backend = Arc::new(ScriptedBackend::new([
            r#"{"search_needed": true, "search_query": "alpha", "assistant_reply": null}"#,
        ]));
        let engine = engine(tmp.path(), backend.clone(), |_| {}).await;
        let reply = engine.answer("alpha?").await;
        assert_eq!(reply.content, BACKEND_UNREACHABLE_MESSAGE);
        // One negotiation call plus three synthesis attempts.
        assert_eq!(backend.call_count(), 4);
    }

    #[tokio::test]
    async fn regenerate_completes_the_edited_history() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::with_results([
            Err(ModelError::Transport("reset".into())),
            Ok("Paris.".to_string()),
        ]));
        let engine = engine(tmp.path(), backend.clone(), |_| {}).await;
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("Capital of France?"),
        ];

        assert_eq!(engine.regenerate(&history).await, "Paris.");
        assert_eq!(backend.call_count(), 2);
        assert_eq!(backend.calls()[1], history);
    }

    #[tokio::test]
    async fn regenerate_respects_the_turn_deadline() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::hanging(Duration::from_secs(60)));
        let engine = engine(tmp.path(), backend.clone(), |_| {}).await;
        let engine = ChatEngine {
            turn_timeout: Duration::from_millis(20),
            ..engine
        };
        let reply = engine.regenerate(&[ChatMessage::user("hi")]).await;
        assert_eq!(reply, TURN_TIMEOUT_MESSAGE);
    }

    #[tokio::test]
    async fn always_timing_out_backend_still_produces_text() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::hanging(Duration::from_secs(60)));
        let engine = engine(tmp.path(), backend.clone(), |c| {
            c.negotiation.max_attempts = 2;
            c.synthesis.attempts = 2;
        })
        .await;
        // Shrink the per-call timeout below what the config can express.
        let engine = ChatEngine {
            negotiator: Negotiator::new(backend.clone(), 2, Duration::from_millis(20)),
            policy: RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(1),
                call_timeout: Duration::from_millis(20),
            },
            ..engine
        };

        let reply = engine.answer("anyone there?").await;
        assert_eq!(reply.content, BACKEND_UNREACHABLE_MESSAGE);
        assert!(!reply.decision.search_needed);

        let reply = engine
            .answer_within("anyone there?", Duration::from_millis(10))
            .await;
        assert_eq!(reply.content, TURN_TIMEOUT_MESSAGE);
    }
}
