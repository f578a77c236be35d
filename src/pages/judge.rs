use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::reconcile::{
    Candidate, Confidence, Decisions, PageCandidates, PageDecision, SelectionDecision,
    SelectionReason, UnavailableReason, decide_by_rule,
};

pub const DEFAULT_PREVIEW_CHARS: usize = 300;
pub const DEFAULT_JUDGE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_JUDGE_MODEL: &str = "gpt-3.5-turbo";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JudgeError {
    #[error("judge timed out")]
    Timeout,

    #[error("malformed judge response: {0}")]
    Malformed(String),

    #[error("judge transport error: {0}")]
    Transport(String),
}

impl From<JudgeError> for UnavailableReason {
    fn from(error: JudgeError) -> Self {
        match error {
            JudgeError::Timeout => Self::JudgeTimeout,
            JudgeError::Malformed(detail) => Self::JudgeMalformed(detail),
            JudgeError::Transport(detail) => Self::JudgeFailed(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidatePreview {
    pub source: String,
    pub preview: String,
    pub truncated: bool,
}

impl CandidatePreview {
    pub fn from_candidate(candidate: &Candidate, preview_chars: usize) -> Self {
        let total = candidate.text.chars().count();
        Self {
            source: candidate.source.clone(),
            preview: candidate.text.chars().take(preview_chars).collect(),
            truncated: total > preview_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JudgeRequest {
    pub page: u32,
    pub candidates: Vec<CandidatePreview>,
}

/// Structured verdict as returned by a judge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JudgeVerdict {
    pub selected_source: String,
    #[serde(default)]
    pub reason: String,
    pub confidence: String,
}

/// Per-page comparison capability used by the scored strategy.
#[async_trait]
pub trait PageJudge: Send + Sync + Debug {
    async fn judge(&self, request: JudgeRequest) -> Result<JudgeVerdict, JudgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoredOptions {
    pub max_concurrency: usize,
    pub timeout: Duration,
    pub preview_chars: usize,
}

impl Default for ScoredOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            timeout: Duration::from_millis(DEFAULT_JUDGE_TIMEOUT_MS),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

/// Checks a verdict against the page's candidates and turns it into a decision.
pub fn validate_verdict(
    verdict: JudgeVerdict,
    candidates: &[Candidate],
) -> Result<SelectionDecision, JudgeError> {
    let selected = verdict.selected_source.trim();
    let Some(candidate) = candidates
        .iter()
        .find(|candidate| candidate.source.eq_ignore_ascii_case(selected))
    else {
        return Err(JudgeError::Malformed(format!(
            "selected source '{selected}' is not a candidate"
        )));
    };
    if candidate.is_blank() {
        return Err(JudgeError::Malformed(format!(
            "selected source '{}' has no text",
            candidate.source
        )));
    }
    let Some(confidence) = Confidence::parse(&verdict.confidence) else {
        return Err(JudgeError::Malformed(format!(
            "unknown confidence '{}'",
            verdict.confidence
        )));
    };

    Ok(SelectionDecision {
        selected_source: candidate.source.clone(),
        reason: SelectionReason::Judged {
            explanation: verdict.reason.trim().to_string(),
        },
        confidence,
    })
}

/// Judges every contested page concurrently, bounded by `max_concurrency`.
/// Pages with fewer than two usable candidates are decided by the rule
/// strategy without a judge call. When `cancel` resolves, pages still in
/// flight are marked cancelled and completed decisions are kept.
pub async fn reconcile_scored<F>(
    judge: Arc<dyn PageJudge>,
    candidates: &PageCandidates,
    options: ScoredOptions,
    cancel: F,
) -> Decisions
where
    F: Future<Output = ()>,
{
    let primary = candidates.primary().unwrap_or_default().to_string();
    let mut decisions = Decisions::new();
    let mut contested = BTreeMap::<u32, Vec<Candidate>>::new();

    for page in candidates.page_numbers() {
        let page_candidates = candidates.candidates(page);
        let usable = page_candidates
            .iter()
            .filter(|candidate| !candidate.is_blank())
            .count();
        if usable < 2 {
            decisions.insert(page, decide_by_rule(&primary, page_candidates));
        } else {
            contested.insert(page, page_candidates.to_vec());
        }
    }

    info!(
        pages = candidates.page_count(),
        contested = contested.len(),
        max_concurrency = options.max_concurrency.max(1),
        timeout_ms = options.timeout.as_millis() as u64,
        "starting scored reconciliation"
    );

    let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for (page, page_candidates) in &contested {
        let judge = Arc::clone(&judge);
        let semaphore = Arc::clone(&semaphore);
        let page = *page;
        let page_candidates = page_candidates.clone();
        let request = JudgeRequest {
            page,
            candidates: page_candidates
                .iter()
                .map(|candidate| CandidatePreview::from_candidate(candidate, options.preview_chars))
                .collect(),
        };
        let timeout = options.timeout;

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (page, Err(JudgeError::Transport("worker pool closed".to_string())));
            };
            let outcome = match tokio::time::timeout(timeout, judge.judge(request)).await {
                Ok(Ok(verdict)) => validate_verdict(verdict, &page_candidates),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(JudgeError::Timeout),
            };
            (page, outcome)
        });
    }

    tokio::pin!(cancel);
    let mut cancelled = false;
    while !tasks.is_empty() {
        tokio::select! {
            joined = tasks.join_next() => {
                let Some(joined) = joined else {
                    break;
                };
                match joined {
                    Ok((page, Ok(decision))) => {
                        debug!(page, source = %decision.selected_source, "judge selected source");
                        decisions.insert(page, PageDecision::Selected(decision));
                    }
                    Ok((page, Err(error))) => {
                        warn!(page, error = %error, "judge failed for page");
                        decisions.insert(page, PageDecision::unavailable(error.into()));
                    }
                    Err(error) => {
                        warn!(error = %error, "judge task aborted");
                    }
                }
            }
            _ = &mut cancel => {
                cancelled = true;
                tasks.abort_all();
                break;
            }
        }
    }

    for page in contested.keys() {
        decisions.entry(*page).or_insert_with(|| {
            if cancelled {
                PageDecision::unavailable(UnavailableReason::Cancelled)
            } else {
                PageDecision::unavailable(UnavailableReason::JudgeFailed(
                    "judge task did not complete".to_string(),
                ))
            }
        });
    }

    if cancelled {
        warn!(
            completed = decisions
                .values()
                .filter(|decision| decision.selected().is_some())
                .count(),
            "scored reconciliation cancelled; keeping completed pages"
        );
    }

    decisions
}

/// Judge backed by an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiJudge {
    client: reqwest::Client,
    auth_header: String,
    base_url: String,
    model: String,
}

impl OpenAiJudge {
    pub fn new(
        api_key: impl Into<String>,
        base_url: Option<String>,
        model: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build judge http client")?;
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            auth_header: format!("Bearer {}", api_key.into()),
            base_url,
            model: model.unwrap_or_else(|| DEFAULT_JUDGE_MODEL.to_string()),
        })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn build_request(&self, request: &JudgeRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "temperature": 0.1,
            "max_tokens": 1000,
            "messages": [
                {
                    "role": "system",
                    "content": "You compare text extractions of insurance documents. Data completeness and correctness matter more than formatting. Reply with JSON only."
                },
                {
                    "role": "user",
                    "content": build_prompt(request)
                }
            ]
        })
    }
}

#[async_trait]
impl PageJudge for OpenAiJudge {
    async fn judge(&self, request: JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
        let response = self
            .client
            .post(self.chat_completions_url())
            .header("Authorization", &self.auth_header)
            .json(&self.build_request(&request))
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    JudgeError::Timeout
                } else {
                    JudgeError::Transport(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(JudgeError::Transport(format!("http status {status}")));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|error| JudgeError::Malformed(error.to_string()))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| JudgeError::Malformed("no message content".to_string()))?;

        parse_verdict(&content)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

fn build_prompt(request: &JudgeRequest) -> String {
    let mut prompt = format!(
        "Compare the text extractions for page {} and choose the one with the most complete and accurate data.\n\
         Blank form fields and character recognition errors (0/O, 1/I, 8/B) count against a source.\n\n",
        request.page
    );

    for candidate in &request.candidates {
        let preview = if candidate.preview.trim().is_empty() {
            "NOT AVAILABLE"
        } else {
            candidate.preview.as_str()
        };
        prompt.push_str(&format!("SOURCE {} (page {}):\n{}\n", candidate.source, request.page, preview));
        if candidate.truncated {
            prompt.push_str("[... text truncated for analysis ...]\n");
        }
        prompt.push('\n');
    }

    let names = request
        .candidates
        .iter()
        .map(|candidate| format!("\"{}\"", candidate.source))
        .collect::<Vec<String>>()
        .join(" or ");
    prompt.push_str(&format!(
        "Return only JSON: {{\"page\": {}, \"selected_source\": {}, \"reason\": \"brief explanation\", \"confidence\": \"high\" or \"medium\" or \"low\"}}",
        request.page, names
    ));
    prompt
}

/// Parses a verdict from model output, tolerating Markdown code fences.
pub fn parse_verdict(content: &str) -> Result<JudgeVerdict, JudgeError> {
    let mut body = content.trim();
    if let Some(stripped) = body.strip_prefix("```json") {
        body = stripped;
    } else if let Some(stripped) = body.strip_prefix("```") {
        body = stripped;
    }
    if let Some(stripped) = body.strip_suffix("```") {
        body = stripped;
    }

    serde_json::from_str::<JudgeVerdict>(body.trim())
        .map_err(|error| JudgeError::Malformed(error.to_string()))
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::mock::{MockJudge, Scripted};
    use super::*;

    fn two_source_pages(pages: &[(u32, &str, &str)]) -> PageCandidates {
        let mut map = BTreeMap::new();
        for (page, ocr, text) in pages {
            map.insert(
                *page,
                vec![
                    Candidate {
                        source: "ocr".to_string(),
                        text: ocr.to_string(),
                    },
                    Candidate {
                        source: "text".to_string(),
                        text: text.to_string(),
                    },
                ],
            );
        }
        PageCandidates::from_pages(vec!["ocr".to_string(), "text".to_string()], map)
    }

    fn options(max_concurrency: usize, timeout_ms: u64) -> ScoredOptions {
        ScoredOptions {
            max_concurrency,
            timeout: Duration::from_millis(timeout_ms),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    #[test]
    fn verdict_parser_strips_code_fences() {
        let verdict = parse_verdict(
            "```json\n{\"page\": 2, \"selected_source\": \"text\", \"reason\": \"complete\", \"confidence\": \"high\"}\n```",
        )
        .expect("fenced json parses");
        assert_eq!(verdict.selected_source, "text");
        assert_eq!(verdict.confidence, "high");

        assert!(matches!(
            parse_verdict("I think OCR is better"),
            Err(JudgeError::Malformed(_))
        ));
    }

    #[test]
    fn verdict_for_unknown_or_blank_source_is_malformed() {
        let candidates = vec![
            Candidate {
                source: "ocr".to_string(),
                text: "value".to_string(),
            },
            Candidate {
                source: "text".to_string(),
                text: " ".to_string(),
            },
        ];
        let verdict = |source: &str, confidence: &str| JudgeVerdict {
            selected_source: source.to_string(),
            reason: String::new(),
            confidence: confidence.to_string(),
        };

        assert!(validate_verdict(verdict("vision", "high"), &candidates).is_err());
        assert!(validate_verdict(verdict("text", "high"), &candidates).is_err());
        assert!(validate_verdict(verdict("ocr", "certain"), &candidates).is_err());

        let decision = validate_verdict(verdict("OCR", "Low"), &candidates).expect("valid verdict");
        assert_eq!(decision.selected_source, "ocr");
        assert_eq!(decision.confidence, Confidence::Low);
    }

    #[test]
    fn previews_are_truncated_by_characters() {
        let preview = CandidatePreview::from_candidate(
            &Candidate {
                source: "ocr".to_string(),
                text: "é".repeat(10),
            },
            4,
        );
        assert_eq!(preview.preview.chars().count(), 4);
        assert!(preview.truncated);
    }

    #[tokio::test]
    async fn failures_stay_local_to_their_page() {
        let candidates = two_source_pages(&[
            (1, "ocr one", "text one"),
            (2, "ocr two", "text two"),
            (3, "ocr three", "text three"),
            (4, "ocr four", ""),
        ]);
        let judge = MockJudge::new()
            .on(1, Scripted::Pick("text"))
            .on(2, Scripted::Fail(JudgeError::Malformed("not json".to_string())))
            .on(3, Scripted::Pick("scanner"));

        let decisions = reconcile_scored(
            Arc::new(judge),
            &candidates,
            options(1, 1_000),
            std::future::pending(),
        )
        .await;

        assert_eq!(decisions.len(), 4);
        assert_eq!(decisions[&1].selected().map(|d| d.selected_source.as_str()), Some("text"));
        assert!(matches!(
            decisions[&2],
            PageDecision::Unavailable {
                reason: UnavailableReason::JudgeMalformed(_)
            }
        ));
        assert!(matches!(
            decisions[&3],
            PageDecision::Unavailable {
                reason: UnavailableReason::JudgeMalformed(_)
            }
        ));
        let page_four = decisions[&4].selected().expect("rule decides uncontested page");
        assert_eq!(page_four.reason, SelectionReason::PrimaryPreferred);
    }

    #[tokio::test]
    async fn hanging_judge_times_out_per_page() {
        let candidates = two_source_pages(&[(1, "a", "b"), (2, "c", "d")]);
        let judge = MockJudge::new().on(2, Scripted::Hang);

        let decisions = reconcile_scored(
            Arc::new(judge),
            &candidates,
            options(2, 50),
            std::future::pending(),
        )
        .await;

        assert!(decisions[&1].selected().is_some());
        assert_eq!(
            decisions[&2],
            PageDecision::unavailable(UnavailableReason::JudgeTimeout)
        );
    }

    #[tokio::test]
    async fn cancellation_keeps_completed_pages() {
        let candidates = two_source_pages(&[(1, "a", "b"), (2, "c", "d"), (3, "e", "")]);
        let judge = MockJudge::new().on(2, Scripted::Hang);

        let decisions = reconcile_scored(
            Arc::new(judge),
            &candidates,
            options(4, 60_000),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await;

        assert!(decisions[&1].selected().is_some());
        assert!(decisions[&3].selected().is_some());
        assert_eq!(
            decisions[&2],
            PageDecision::unavailable(UnavailableReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn sequential_budget_still_decides_every_page() {
        let pages = (1..=6)
            .map(|page| (page, "ocr body", "text body"))
            .collect::<Vec<(u32, &str, &str)>>();
        let candidates = two_source_pages(&pages);
        let judge = MockJudge::new().with_delay(Duration::from_millis(5));

        let decisions = reconcile_scored(
            Arc::new(judge),
            &candidates,
            options(1, 1_000),
            std::future::pending(),
        )
        .await;

        assert_eq!(decisions.keys().copied().collect::<Vec<u32>>(), vec![1, 2, 3, 4, 5, 6]);
        assert!(decisions.values().all(|decision| decision.selected().is_some()));
    }

    #[test]
    fn prompt_lists_every_candidate() {
        let prompt = build_prompt(&JudgeRequest {
            page: 7,
            candidates: vec![
                CandidatePreview {
                    source: "ocr".to_string(),
                    preview: "Account No. 817553.1".to_string(),
                    truncated: true,
                },
                CandidatePreview {
                    source: "text".to_string(),
                    preview: String::new(),
                    truncated: false,
                },
            ],
        });
        assert!(prompt.contains("SOURCE ocr (page 7)"));
        assert!(prompt.contains("NOT AVAILABLE"));
        assert!(prompt.contains("text truncated"));
        assert!(prompt.contains("\"ocr\" or \"text\""));
    }
}
