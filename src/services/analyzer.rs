use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::coalescer::{CoalesceKey, GenerationOptions, RequestCoalescer};
use crate::context;
use crate::error::{AppError, AppResult};
use crate::models::{AnalysisResult, AnalyzeRequest};

const DEFAULT_SUMMARY_WORDS: usize = 32;

const POSITIVE: &[&str] = &[
    "good", "great", "excellent", "love", "happy", "fast", "reliable", "clean", "helpful", "nice",
];
const NEGATIVE: &[&str] = &[
    "bad", "poor", "terrible", "hate", "sad", "slow", "broken", "buggy", "awful", "angry",
];

/// Simulated metered text-analysis provider.
///
/// Every provider call costs `latency` and bumps a counter; identical
/// concurrent requests are funnelled through the shared [`RequestCoalescer`]
/// so the provider runs once per distinct key.
///
/// # Counter Memory Ordering
///
/// `provider_calls` is a monotonic metrics counter and uses
/// `Ordering::Relaxed`.
#[derive(Clone)]
pub struct TextAnalyzer {
    provider: Arc<str>,
    latency: Duration,
    coalescer: RequestCoalescer<AnalysisResult>,
    provider_calls: Arc<AtomicU64>,
}

impl std::fmt::Debug for TextAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextAnalyzer")
            .field("provider", &self.provider)
            .field("latency", &self.latency)
            .field("provider_calls", &self.provider_calls())
            .finish_non_exhaustive()
    }
}

impl TextAnalyzer {
    pub fn new(
        provider: impl Into<Arc<str>>,
        latency: Duration,
        coalescer: RequestCoalescer<AnalysisResult>,
    ) -> Self {
        Self {
            provider: provider.into(),
            latency,
            coalescer,
            provider_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn coalescer(&self) -> &RequestCoalescer<AnalysisResult> {
        &self.coalescer
    }

    /// Number of times the provider actually ran.
    pub fn provider_calls(&self) -> u64 {
        self.provider_calls.load(Ordering::Relaxed)
    }

    /// Analyze `request`, sharing the provider call with identical requests.
    ///
    /// `cached` is set on the result when this caller did not run the
    /// provider itself (cache hit or joined execution).
    #[instrument(skip(self, request, cancel), fields(provider = %self.provider))]
    pub async fn analyze(
        &self,
        request: &AnalyzeRequest,
        user_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> AppResult<AnalysisResult> {
        let options = GenerationOptions {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            category: request.category.clone(),
            user_id: user_id.map(str::to_string),
            stream: false,
            client_timeout_ms: request.client_timeout_ms,
        };
        let key = CoalesceKey::derive(&self.provider, &request.text, &options);
        let ran = AtomicBool::new(false);

        let executed = &ran;
        let options = &options;
        let text = request.text.as_str();
        let mut result = self
            .coalescer
            .execute(key.as_str(), move || async move {
                executed.store(true, Ordering::Relaxed);
                let call = self.call_provider(text, options, cancel);
                context::with_span("provider.analyze", call).await
            })
            .await?;

        result.cached = !ran.load(Ordering::Relaxed);
        Ok(result)
    }

    async fn call_provider(
        &self,
        text: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> AppResult<AnalysisResult> {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::Internal("Provider call cancelled".to_string()));
            }
            _ = tokio::time::sleep(self.latency) => {}
        }

        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        debug!(calls = self.provider_calls(), "Provider call completed");

        Ok(analyze_text(&self.provider, text, options))
    }
}

/// Deterministic analysis of `text`; the same input and options always
/// produce the same result.
pub fn analyze_text(provider: &str, text: &str, options: &GenerationOptions) -> AnalysisResult {
    let words: Vec<&str> = text.split_whitespace().collect();

    let (positive, negative) = words.iter().fold((0u32, 0u32), |(pos, neg), word| {
        let word = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if POSITIVE.contains(&word.as_str()) {
            (pos + 1, neg)
        } else if NEGATIVE.contains(&word.as_str()) {
            (pos, neg + 1)
        } else {
            (pos, neg)
        }
    });
    let scored = positive + negative;
    let sentiment = if scored == 0 {
        0.0
    } else {
        (positive as f32 - negative as f32) / scored as f32
    };

    let limit = options
        .max_tokens
        .map_or(DEFAULT_SUMMARY_WORDS, |n| n as usize);
    let mut summary = words.iter().take(limit).copied().collect::<Vec<_>>().join(" ");
    if words.len() > limit {
        summary.push_str(" ...");
    }
    if let Some(category) = options.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        summary = format!("[{}] {summary}", category.to_lowercase());
    }

    AnalysisResult {
        provider: provider.to_string(),
        word_count: words.len(),
        sentiment,
        summary,
        cached: false,
    }
}
