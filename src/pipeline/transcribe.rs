//! Per-page transcription: extract, verify, retry, degrade.
//!
//! ## Protocol
//!
//! For each attempt (at most `max_attempts`):
//!
//! 1. the next extraction client reads the page image with
//!    [`EXTRACTION_PROMPT`];
//! 2. the output is cleaned ([`clean_page_text`]);
//! 3. the verification client checks it for refusals with
//!    [`VERIFICATION_PROMPT`] and answers [`VERIFICATION_CLEAN_SIGNAL`] or a
//!    short complaint;
//! 4. a clean verdict returns immediately; a flagged one pauses
//!    `retry_pause_ms` and tries again.
//!
//! Rate limits are a separate retry class: the call sleeps and is repeated
//! without consuming an attempt, up to `max_rate_limit_waits` per page.
//!
//! When every attempt is flagged the page falls back to the longest raw
//! extraction (first one wins on ties) and is marked degraded.
//! [`PageTranscriber::transcribe`] therefore never fails.

use crate::config::IngestionConfig;
use crate::model::{ClientPool, ModelError, ModelRequest};
use crate::output::{PageTranscript, RasterPage, TranscriptionAttempt, Verdict};
use crate::pipeline::cleanup::clean_page_text;
use crate::prompts::{
    verification_input, EXTRACTION_PROMPT, VERIFICATION_CLEAN_SIGNAL, VERIFICATION_PROMPT,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Knobs the transcriber reads from [`IngestionConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeSettings {
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_attempts: u32,
    pub retry_pause: Duration,
    pub rate_limit_backoff: Duration,
    pub max_rate_limit_waits: u32,
}

impl TranscribeSettings {
    pub fn from_config(config: &IngestionConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_attempts: config.max_attempts.max(1),
            retry_pause: Duration::from_millis(config.retry_pause_ms),
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
            max_rate_limit_waits: config.max_rate_limit_waits,
        }
    }
}

impl Default for TranscribeSettings {
    fn default() -> Self {
        Self::from_config(&IngestionConfig::default())
    }
}

/// Picks the degraded fallback: the longest raw text, earliest on ties.
pub fn longest_attempt(attempts: &[TranscriptionAttempt]) -> Option<&TranscriptionAttempt> {
    attempts.iter().fold(None, |best, a| match best {
        Some(b) if b.raw_text.chars().count() >= a.raw_text.chars().count() => Some(b),
        _ => Some(a),
    })
}

/// Transcribes one page at a time; cheap to clone and share across tasks.
#[derive(Debug, Clone)]
pub struct PageTranscriber {
    extraction: ClientPool,
    verification: ClientPool,
    settings: TranscribeSettings,
}

impl PageTranscriber {
    pub fn new(extraction: ClientPool, verification: ClientPool, settings: TranscribeSettings) -> Self {
        Self {
            extraction,
            verification,
            settings,
        }
    }

    /// Transcribe `page`. Always yields a transcript.
    pub async fn transcribe(&self, page: &RasterPage) -> PageTranscript {
        let n = page.page_number;
        let mut attempts: Vec<TranscriptionAttempt> = Vec::new();
        let mut rate_waits = 0u32;

        while (attempts.len() as u32) < self.settings.max_attempts {
            let attempt_index = attempts.len() as u32;
            let client = self.extraction.next_client();
            let request = ModelRequest {
                instruction: EXTRACTION_PROMPT.to_string(),
                text: String::new(),
                image_png: Some(page.image_bytes.clone()),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
            };

            let raw_text = match client.complete(request).await {
                Ok(text) => clean_page_text(&text),
                Err(ModelError::RateLimited { retry_after_ms })
                    if rate_waits < self.settings.max_rate_limit_waits =>
                {
                    rate_waits += 1;
                    let wait = self.backoff(retry_after_ms);
                    warn!(page = n, model = client.name(), wait_ms = wait.as_millis() as u64, "extraction rate limited");
                    sleep(wait).await;
                    continue;
                }
                Err(e) => {
                    warn!(page = n, attempt = attempt_index + 1, model = client.name(), error = %e, "extraction failed");
                    attempts.push(TranscriptionAttempt {
                        page_number: n,
                        attempt_index,
                        raw_text: String::new(),
                        verification_verdict: Verdict::Flagged(format!("extraction failed: {e}")),
                    });
                    self.pause_if_retrying(attempts.len()).await;
                    continue;
                }
            };

            let verdict = if raw_text.trim().is_empty() {
                Verdict::Flagged("empty transcription".into())
            } else {
                self.verify(n, &raw_text, &mut rate_waits).await
            };

            if verdict.is_clean() {
                debug!(page = n, attempt = attempt_index + 1, chars = raw_text.chars().count(), "page transcribed");
                return PageTranscript {
                    page_number: n,
                    text: raw_text,
                    source_marker: PageTranscript::marker_for(n),
                    degraded: false,
                    attempts: attempt_index + 1,
                };
            }

            if let Verdict::Flagged(reason) = &verdict {
                warn!(page = n, attempt = attempt_index + 1, reason = %reason, "extraction flagged by verifier");
            }
            attempts.push(TranscriptionAttempt {
                page_number: n,
                attempt_index,
                raw_text,
                verification_verdict: verdict,
            });
            self.pause_if_retrying(attempts.len()).await;
        }

        let text = longest_attempt(&attempts)
            .map(|a| a.raw_text.clone())
            .unwrap_or_default();
        warn!(
            page = n,
            attempts = attempts.len(),
            chars = text.chars().count(),
            "no clean extraction; using longest attempt"
        );
        PageTranscript {
            page_number: n,
            text,
            source_marker: PageTranscript::marker_for(n),
            degraded: true,
            attempts: attempts.len() as u32,
        }
    }

    /// Ask the verifier about `text`. Rate limits share the page's wait
    /// budget; any other failure flags the attempt.
    async fn verify(&self, page: usize, text: &str, rate_waits: &mut u32) -> Verdict {
        loop {
            let client = self.verification.next_client();
            let request = ModelRequest {
                instruction: VERIFICATION_PROMPT.to_string(),
                text: verification_input(text),
                image_png: None,
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
            };
            match client.complete(request).await {
                Ok(answer) => {
                    let answer = answer.trim();
                    return if answer.starts_with(VERIFICATION_CLEAN_SIGNAL) {
                        Verdict::Clean
                    } else {
                        Verdict::Flagged(answer.chars().take(300).collect())
                    };
                }
                Err(ModelError::RateLimited { retry_after_ms })
                    if *rate_waits < self.settings.max_rate_limit_waits =>
                {
                    *rate_waits += 1;
                    let wait = self.backoff(retry_after_ms);
                    warn!(page, model = client.name(), wait_ms = wait.as_millis() as u64, "verification rate limited");
                    sleep(wait).await;
                }
                Err(e) => {
                    warn!(page, model = client.name(), error = %e, "verification failed");
                    return Verdict::Flagged(format!("verification failed: {e}"));
                }
            }
        }
    }

    fn backoff(&self, retry_after_ms: Option<u64>) -> Duration {
        retry_after_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.rate_limit_backoff)
    }

    async fn pause_if_retrying(&self, used: usize) {
        if (used as u32) < self.settings.max_attempts && !self.settings.retry_pause.is_zero() {
            sleep(self.settings.retry_pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelClient;
    use crate::output::{ImageFormat, ResolutionTier};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Replays a fixed script of responses, then repeats the last one.
    struct Scripted {
        name: &'static str,
        script: Mutex<VecDeque<Result<String, ModelError>>>,
        last: Mutex<Option<Result<String, ModelError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, script: Vec<Result<String, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        async fn complete(&self, _request: ModelRequest) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(r) => {
                    *self.last.lock().unwrap() = Some(r.clone());
                    r
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Err(ModelError::Transient("script empty".into()))),
            }
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn ok(s: &str) -> Result<String, ModelError> {
        Ok(s.to_string())
    }

    fn rate_limited() -> Result<String, ModelError> {
        Err(ModelError::RateLimited { retry_after_ms: Some(1) })
    }

    fn fast_settings() -> TranscribeSettings {
        TranscribeSettings {
            retry_pause: Duration::ZERO,
            rate_limit_backoff: Duration::from_millis(1),
            ..TranscribeSettings::default()
        }
    }

    fn page(n: usize) -> RasterPage {
        RasterPage {
            page_number: n,
            image_bytes: vec![0x89, b'P', b'N', b'G'],
            format: ImageFormat::Png,
            resolution_tier: ResolutionTier::Medium,
        }
    }

    fn transcriber(extract: Arc<Scripted>, verify: Arc<Scripted>) -> PageTranscriber {
        PageTranscriber::new(
            ClientPool::single(extract),
            ClientPool::single(verify),
            fast_settings(),
        )
    }

    #[tokio::test]
    async fn clean_first_attempt_returns_immediately() {
        let extract = Scripted::new("vision", vec![ok("```\nOur Team\n```")]);
        let verify = Scripted::new("check", vec![ok("NO_ISSUES")]);
        let t = transcriber(extract.clone(), verify.clone());

        let out = t.transcribe(&page(3)).await;
        assert_eq!(out.text, "Our Team");
        assert_eq!(out.source_marker, "[Page 3 of source document]");
        assert!(!out.degraded);
        assert_eq!(out.attempts, 1);
        assert_eq!(extract.calls(), 1);
        assert_eq!(verify.calls(), 1);
    }

    #[tokio::test]
    async fn flagged_attempt_is_retried() {
        let extract = Scripted::new("vision", vec![ok("I can't see the image"), ok("Market: $4B")]);
        let verify = Scripted::new("check", vec![ok("The model refused."), ok("NO_ISSUES")]);
        let t = transcriber(extract.clone(), verify);

        let out = t.transcribe(&page(1)).await;
        assert_eq!(out.text, "Market: $4B");
        assert_eq!(out.attempts, 2);
        assert!(!out.degraded);
    }

    #[tokio::test]
    async fn exhausted_attempts_fall_back_to_longest() {
        let extract = Scripted::new(
            "vision",
            vec![ok("short"), ok("the longest output"), ok("mid length"), ok("tiny"), ok("same len 18 chars!")],
        );
        let verify = Scripted::new("check", vec![ok("Refusal detected")]);
        let t = transcriber(extract.clone(), verify);

        let out = t.transcribe(&page(2)).await;
        assert!(out.degraded);
        assert_eq!(out.attempts, 5);
        assert_eq!(out.text, "the longest output");
        assert_eq!(extract.calls(), 5);
    }

    #[tokio::test]
    async fn rate_limits_do_not_consume_attempts() {
        let extract = Scripted::new(
            "vision",
            vec![rate_limited(), rate_limited(), rate_limited(), ok("Pricing")],
        );
        let verify = Scripted::new("check", vec![rate_limited(), ok("NO_ISSUES")]);
        let settings = TranscribeSettings {
            max_attempts: 1,
            ..fast_settings()
        };
        let t = PageTranscriber::new(
            ClientPool::single(extract.clone()),
            ClientPool::single(verify.clone()),
            settings,
        );

        let out = t.transcribe(&page(1)).await;
        assert_eq!(out.text, "Pricing");
        assert_eq!(out.attempts, 1);
        assert!(!out.degraded);
        assert_eq!(extract.calls(), 4);
        assert_eq!(verify.calls(), 2);
    }

    #[tokio::test]
    async fn unbounded_rate_limiting_still_terminates() {
        let extract = Scripted::new("vision", vec![rate_limited()]);
        let verify = Scripted::new("check", vec![ok("NO_ISSUES")]);
        let settings = TranscribeSettings {
            max_attempts: 2,
            max_rate_limit_waits: 3,
            ..fast_settings()
        };
        let t = PageTranscriber::new(
            ClientPool::single(extract.clone()),
            ClientPool::single(verify.clone()),
            settings,
        );

        let out = t.transcribe(&page(7)).await;
        assert!(out.degraded);
        assert_eq!(out.text, "");
        assert_eq!(out.attempts, 2);
        assert_eq!(extract.calls(), 5);
        assert_eq!(verify.calls(), 0);
    }

    #[tokio::test]
    async fn transient_errors_count_as_attempts() {
        let extract = Scripted::new(
            "vision",
            vec![Err(ModelError::Transient("502".into())), ok("Go-to-market")],
        );
        let verify = Scripted::new("check", vec![ok("NO_ISSUES")]);
        let t = transcriber(extract, verify.clone());

        let out = t.transcribe(&page(4)).await;
        assert_eq!(out.text, "Go-to-market");
        assert_eq!(out.attempts, 2);
        assert_eq!(verify.calls(), 1);
    }

    #[tokio::test]
    async fn verifier_failure_keeps_text_for_fallback() {
        let extract = Scripted::new("vision", vec![ok("Roadmap Q3")]);
        let verify = Scripted::new("check", vec![Err(ModelError::Transient("timeout".into()))]);
        let settings = TranscribeSettings {
            max_attempts: 2,
            ..fast_settings()
        };
        let t = PageTranscriber::new(ClientPool::single(extract), ClientPool::single(verify), settings);

        let out = t.transcribe(&page(5)).await;
        assert!(out.degraded);
        assert_eq!(out.text, "Roadmap Q3");
    }

    #[tokio::test]
    async fn extraction_rotates_through_pool() {
        let a = Scripted::new("a", vec![ok("refused")]);
        let b = Scripted::new("b", vec![ok("Slide body")]);
        let verify = Scripted::new("check", vec![ok("Refusal"), ok("NO_ISSUES")]);
        let t = PageTranscriber::new(
            ClientPool::new(vec![a.clone() as Arc<dyn ModelClient>, b.clone()]).unwrap(),
            ClientPool::single(verify),
            fast_settings(),
        );

        let out = t.transcribe(&page(1)).await;
        assert_eq!(out.text, "Slide body");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[test]
    fn longest_attempt_prefers_first_on_ties() {
        let mk = |i: u32, s: &str| TranscriptionAttempt {
            page_number: 1,
            attempt_index: i,
            raw_text: s.into(),
            verification_verdict: Verdict::Flagged("x".into()),
        };
        let attempts = vec![mk(0, "ab"), mk(1, "abcd"), mk(2, "wxyz"), mk(3, "a")];
        assert_eq!(longest_attempt(&attempts).unwrap().attempt_index, 1);
        assert!(longest_attempt(&[]).is_none());
    }
}
