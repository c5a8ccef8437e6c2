//! Recommendation strategies.
//!
//! An advisor picks one worker from an already ranked candidate set. It never
//! widens the set: whatever it returns must be one of the candidates.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{AdvisorConfig, AdvisorStrategy};
use crate::dispatch::filter::Candidate;
use crate::dispatch::result::Method;
use crate::error::RecommendationError;
use crate::history::HistoricalContext;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::model::Task;

/// Input to a recommendation.
#[derive(Debug, Clone, Copy)]
pub struct RecommendationRequest<'a> {
    pub task: &'a Task,
    /// Ranked best first.
    pub candidates: &'a [Candidate],
    pub history: Option<&'a HistoricalContext>,
}

/// A chosen worker and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub worker_id: String,
    pub rationale: String,
    pub method: Method,
}

#[async_trait]
pub trait RecommendationAdvisor: Send + Sync {
    fn method(&self) -> Method;

    async fn recommend(
        &self,
        request: &RecommendationRequest<'_>,
    ) -> Result<Recommendation, RecommendationError>;
}

/// Picks the top-ranked candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlgorithmicAdvisor;

#[async_trait]
impl RecommendationAdvisor for AlgorithmicAdvisor {
    fn method(&self) -> Method {
        Method::Algorithmic
    }

    async fn recommend(
        &self,
        request: &RecommendationRequest<'_>,
    ) -> Result<Recommendation, RecommendationError> {
        let best = request
            .candidates
            .first()
            .ok_or(RecommendationError::NoCandidates)?;
        Ok(Recommendation {
            worker_id: best.worker.id.clone(),
            rationale: format!("Highest match score: {:.1}", best.score),
            method: Method::Algorithmic,
        })
    }
}

const SYSTEM_PROMPT: &str = "You assign tasks to workers. You receive a JSON document describing \
one task, a ranked list of eligible candidates and, when available, similar past tasks with \
their outcomes. Recommend exactly one candidate, weighing skill match first, then current \
workload (lower is better), then experience (senior for high priority), then past success \
on similar work. Reply with a single JSON object: {\"worker_id\": \"<candidate id>\", \
\"reason\": \"<short explanation>\"}. Never recommend anyone outside the candidate list.";

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Model reply. Older prompts used `user_id`; both are accepted.
#[derive(Debug, Deserialize)]
struct AdvisorReply {
    #[serde(alias = "user_id")]
    worker_id: String,
    #[serde(default)]
    reason: String,
}

/// Pull the first JSON object out of free-form model output.
fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(caps) = FENCED_JSON.captures(trimmed) {
        return caps.get(1).map(|m| m.as_str());
    }

    // Scan for the first balanced object, respecting strings.
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in trimmed[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&trimmed[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_reply(
    raw: &str,
    candidates: &[Candidate],
) -> Result<AdvisorReply, RecommendationError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| RecommendationError::Malformed("no JSON object in reply".to_string()))?;
    let reply: AdvisorReply = serde_json::from_str(json)
        .map_err(|e| RecommendationError::Malformed(format!("JSON parse error: {e}")))?;

    if !candidates.iter().any(|c| c.worker.id == reply.worker_id) {
        return Err(RecommendationError::NotACandidate {
            worker_id: reply.worker_id,
        });
    }
    Ok(reply)
}

/// Asks an external model to choose among the candidates.
pub struct GenerativeAdvisor {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    temperature: f32,
    max_tokens: u32,
}

impl GenerativeAdvisor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &AdvisorConfig) -> Self {
        Self {
            llm,
            timeout: config.timeout,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn build_payload(request: &RecommendationRequest<'_>) -> serde_json::Value {
        let task = request.task;
        let candidates: Vec<serde_json::Value> = request
            .candidates
            .iter()
            .map(|c| {
                json!({
                    "worker_id": c.worker.id,
                    "name": c.worker.name,
                    "skills": c.worker.skills,
                    "current_load": c.worker.load_label(),
                    "experience": c.worker.experience,
                    "match_score": c.score,
                    "historical_success_rate": request
                        .history
                        .and_then(|h| h.success_rate_for(&c.worker.id)),
                })
            })
            .collect();

        let similar = request
            .history
            .map(|h| serde_json::to_value(&h.similar).unwrap_or_default())
            .unwrap_or_else(|| json!([]));

        json!({
            "task": {
                "id": task.id,
                "name": task.name,
                "type": task.task_type,
                "required_skills": task.required_skills,
                "priority": task.priority,
                "due_at": task.due_at.to_rfc3339(),
                "current_assignee": task.assigned_worker,
            },
            "candidates": candidates,
            "similar_tasks": similar,
        })
    }
}

#[async_trait]
impl RecommendationAdvisor for GenerativeAdvisor {
    fn method(&self) -> Method {
        Method::Generative
    }

    async fn recommend(
        &self,
        request: &RecommendationRequest<'_>,
    ) -> Result<Recommendation, RecommendationError> {
        if request.candidates.is_empty() {
            return Err(RecommendationError::NoCandidates);
        }

        let payload = Self::build_payload(request);
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(serde_json::to_string_pretty(&payload).map_err(|e| {
                RecommendationError::Malformed(format!("failed to encode context: {e}"))
            })?),
        ])
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = tokio::time::timeout(self.timeout, self.llm.complete(completion))
            .await
            .map_err(|_| RecommendationError::Timeout(self.timeout))??;

        let reply = parse_reply(&response.content, request.candidates).inspect_err(|e| {
            debug!(
                task_id = %request.task.id,
                raw_response = %response.content,
                error = %e,
                "Rejected advisor reply"
            );
        })?;

        let rationale = if reply.reason.trim().is_empty() {
            format!("Recommended by {}", self.llm.model_name())
        } else {
            reply.reason
        };

        Ok(Recommendation {
            worker_id: reply.worker_id,
            rationale,
            method: Method::Generative,
        })
    }
}

/// Configured strategy with algorithmic fallback.
pub struct Advisor {
    primary: Option<Arc<dyn RecommendationAdvisor>>,
    fallback: AlgorithmicAdvisor,
}

impl Advisor {
    /// Purely algorithmic.
    pub fn algorithmic() -> Self {
        Self {
            primary: None,
            fallback: AlgorithmicAdvisor,
        }
    }

    /// Prefer `primary`, falling back to the algorithmic strategy on error.
    pub fn with_primary(primary: Arc<dyn RecommendationAdvisor>) -> Self {
        Self {
            primary: Some(primary),
            fallback: AlgorithmicAdvisor,
        }
    }

    /// Build from configuration. A generative strategy without a provider
    /// degrades to algorithmic.
    pub fn from_config(config: &AdvisorConfig, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        match (config.strategy, llm) {
            (AdvisorStrategy::Generative, Some(llm)) => {
                Self::with_primary(Arc::new(GenerativeAdvisor::new(llm, config)))
            }
            (AdvisorStrategy::Generative, None) => {
                warn!("Generative advisor configured without an LLM provider, using algorithmic");
                Self::algorithmic()
            }
            (AdvisorStrategy::Algorithmic, _) => Self::algorithmic(),
        }
    }

    /// Whether the primary strategy uses historical context.
    pub fn wants_history(&self) -> bool {
        self.primary.is_some()
    }

    /// Recommend a worker. Fails only when there are no candidates.
    pub async fn recommend(
        &self,
        request: &RecommendationRequest<'_>,
    ) -> Result<Recommendation, RecommendationError> {
        if let Some(primary) = &self.primary {
            match primary.recommend(request).await {
                Ok(rec) => return Ok(rec),
                Err(RecommendationError::NoCandidates) => {
                    return Err(RecommendationError::NoCandidates);
                }
                Err(e) => {
                    warn!(
                        task_id = %request.task.id,
                        method = %primary.method(),
                        error = %e,
                        "Advisor failed, falling back to algorithmic"
                    );
                    let mut rec = self.fallback.recommend(request).await?;
                    rec.rationale = format!("Algorithmic fallback - {}", rec.rationale);
                    return Ok(rec);
                }
            }
        }
        self.fallback.recommend(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};
    use crate::model::Worker;

    struct StubLlm {
        reply: Result<String, ()>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StubLlm {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 10,
                    output_tokens: 10,
                    finish_reason: FinishReason::Stop,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "boom".into(),
                }),
            }
        }
    }

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate {
                worker: Worker::new("A", "Ada", 2),
                score: 2100.0,
            },
            Candidate {
                worker: Worker::new("B", "Bob", 2),
                score: 1100.0,
            },
        ]
    }

    fn config(timeout: Duration) -> AdvisorConfig {
        AdvisorConfig {
            strategy: AdvisorStrategy::Generative,
            timeout,
            ..AdvisorConfig::default()
        }
    }

    async fn run(llm: StubLlm, timeout: Duration) -> Recommendation {
        let advisor = Advisor::from_config(&config(timeout), Some(Arc::new(llm)));
        let task = Task::new("T", "t", Utc::now());
        let cands = candidates();
        advisor
            .recommend(&RecommendationRequest {
                task: &task,
                candidates: &cands,
                history: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn algorithmic_picks_top() {
        let task = Task::new("T", "t", Utc::now());
        let cands = candidates();
        let rec = AlgorithmicAdvisor
            .recommend(&RecommendationRequest {
                task: &task,
                candidates: &cands,
                history: None,
            })
            .await
            .unwrap();
        assert_eq!(rec.worker_id, "A");
        assert_eq!(rec.rationale, "Highest match score: 2100.0");
    }

    #[tokio::test]
    async fn algorithmic_fails_on_empty() {
        let task = Task::new("T", "t", Utc::now());
        let err = Advisor::algorithmic()
            .recommend(&RecommendationRequest {
                task: &task,
                candidates: &[],
                history: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RecommendationError::NoCandidates));
    }

    #[tokio::test]
    async fn generative_choice_accepted() {
        let rec = run(
            StubLlm::replying(r#"Sure! ```json {"worker_id": "B", "reason": "lighter load"} ```"#),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(rec.worker_id, "B");
        assert_eq!(rec.method, Method::Generative);
        assert_eq!(rec.rationale, "lighter load");
    }

    #[tokio::test]
    async fn legacy_user_id_field_accepted() {
        let rec = run(
            StubLlm::replying(r#"{"user_id": "B", "reason": "ok"}"#),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(rec.worker_id, "B");
    }

    #[tokio::test]
    async fn non_candidate_falls_back() {
        let rec = run(
            StubLlm::replying(r#"{"worker_id": "Z", "reason": "?"}"#),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(rec.worker_id, "A");
        assert_eq!(rec.method, Method::Algorithmic);
        assert!(rec.rationale.starts_with("Algorithmic fallback - "));
    }

    #[tokio::test]
    async fn malformed_output_falls_back() {
        let rec = run(StubLlm::replying("I pick Bob"), Duration::from_secs(5)).await;
        assert_eq!(rec.method, Method::Algorithmic);
    }

    #[tokio::test]
    async fn provider_error_falls_back() {
        let llm = StubLlm {
            reply: Err(()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        };
        let rec = run(llm, Duration::from_secs(5)).await;
        assert_eq!(rec.method, Method::Algorithmic);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back() {
        let llm = StubLlm {
            reply: Ok(r#"{"worker_id": "B", "reason": "late"}"#.into()),
            delay: Duration::from_secs(60),
            calls: AtomicUsize::new(0),
        };
        let rec = run(llm, Duration::from_secs(1)).await;
        assert_eq!(rec.worker_id, "A");
        assert_eq!(rec.method, Method::Algorithmic);
    }

    #[test]
    fn extracts_first_balanced_object() {
        let raw = r#"Answer: {"worker_id": "A", "reason": "has {braces} in \"text\""} trailing {x}"#;
        let json = extract_json_object(raw).unwrap();
        assert!(json.ends_with(r#"text\""}"#));
        assert!(serde_json::from_str::<serde_json::Value>(json).is_ok());
    }

    #[test]
    fn payload_includes_history_rate() {
        use crate::history::{HistoricalOutcome, Outcome};

        let task = Task::new("T", "t", Utc::now()).with_skill("go", 2);
        let cands = candidates();
        let history = HistoricalContext::new(vec![HistoricalOutcome {
            task_id: "P".into(),
            task_name: "p".into(),
            worker_id: "A".into(),
            outcome: Outcome::Success,
            duration_secs: Some(60),
            similarity: 1.0,
        }]);
        let payload = GenerativeAdvisor::build_payload(&RecommendationRequest {
            task: &task,
            candidates: &cands,
            history: Some(&history),
        });
        assert_eq!(payload["candidates"][0]["historical_success_rate"], 1.0);
        assert!(payload["candidates"][1]["historical_success_rate"].is_null());
        assert_eq!(payload["similar_tasks"][0]["task_id"], "P");
        assert_eq!(payload["task"]["required_skills"]["go"], 2);
    }
}
