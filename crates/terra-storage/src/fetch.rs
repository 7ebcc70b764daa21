//! One-request-at-a-time HTTP fetcher with identity rotation and jittered backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Server errors are transient; every other non-success status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fractional spread applied symmetrically around the base delay.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map(|raw| raw.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// `unit` in `[-1, 1]` picks where inside the jitter band the delay lands.
    pub fn jittered(&self, base: Duration, unit: f64) -> Duration {
        let spread = 1.0 + self.jitter_ratio * unit.clamp(-1.0, 1.0);
        base.mul_f64(spread.max(0.0))
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.jittered(self.base_delay_for_attempt(attempt_index), unit)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub min_interval: Duration,
    pub first_timeout: Duration,
    pub fallback_timeout: Duration,
    pub user_agents: Vec<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            first_timeout: Duration::from_secs(15),
            fallback_timeout: Duration::from_secs(30),
            user_agents: default_user_agents(),
            backoff: BackoffPolicy::default(),
        }
    }
}

pub fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
    ]
    .into_iter()
    .map(ToString::to_string)
    .collect()
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("gave up on {url} after {attempts} attempts: {last_failure}")]
    Exhausted {
        attempts: usize,
        url: String,
        last_failure: String,
    },
}

/// Per-source fetcher. Requests through one instance never overlap and are
/// spaced at least `min_interval` apart.
#[derive(Debug)]
pub struct RateLimitedFetcher {
    label: String,
    client: reqwest::Client,
    config: FetcherConfig,
    last_request: Mutex<Option<Instant>>,
    agent_cursor: AtomicUsize,
}

impl RateLimitedFetcher {
    pub fn new(label: impl Into<String>, config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            label: label.into(),
            client,
            config,
            last_request: Mutex::new(None),
            agent_cursor: AtomicUsize::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn next_user_agent(&self) -> Option<&str> {
        if self.config.user_agents.is_empty() {
            return None;
        }
        let idx = self.agent_cursor.fetch_add(1, Ordering::Relaxed) % self.config.user_agents.len();
        self.config.user_agents.get(idx).map(String::as_str)
    }

    async fn wait_for_slot(&self, clock: &mut Option<Instant>) {
        if let Some(last) = *clock {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_interval {
                tokio::time::sleep(self.config.min_interval - elapsed).await;
            }
        }
        *clock = Some(Instant::now());
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", source = %self.label, url);
        self.fetch_inner(url).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedPage, FetchError> {
        // Held for the whole call so retries of one request do not interleave with another.
        let mut clock = self.last_request.lock().await;
        let backoff = self.config.backoff;
        let total_attempts = backoff.max_retries + 1;
        let mut last_failure = String::new();

        for attempt in 0..total_attempts {
            if attempt > 0 {
                let delay = backoff.delay_for_attempt(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(delay).await;
            }
            self.wait_for_slot(&mut clock).await;

            let timeout = if attempt == 0 {
                self.config.first_timeout
            } else {
                self.config.fallback_timeout
            };
            let mut request = self.client.get(url).timeout(timeout);
            if let Some(agent) = self.next_user_agent() {
                request = request.header(USER_AGENT, agent);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.text().await {
                            Ok(body) => {
                                return Ok(FetchedPage {
                                    url: url.to_string(),
                                    final_url,
                                    status: status.as_u16(),
                                    body,
                                    fetched_at: Utc::now(),
                                    attempts: attempt + 1,
                                })
                            }
                            Err(err) => {
                                if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                                    return Err(FetchError::Request(err));
                                }
                                warn!(attempt, error = %err, "body read failed");
                                last_failure = err.to_string();
                                continue;
                            }
                        }
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Status {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    warn!(attempt, status = status.as_u16(), "retryable http status");
                    last_failure = format!("http status {}", status.as_u16());
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    warn!(attempt, error = %err, "retryable request failure");
                    last_failure = err.to_string();
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts: total_attempts,
            url: url.to_string(),
            last_failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(max_retries: usize) -> FetcherConfig {
        FetcherConfig {
            min_interval: Duration::from_millis(0),
            first_timeout: Duration::from_millis(500),
            fallback_timeout: Duration::from_secs(1),
            user_agents: vec!["agent-a".into(), "agent-b".into()],
            backoff: BackoffPolicy {
                max_retries,
                initial_delay: Duration::from_millis(5),
                multiplier: 2.0,
                max_delay: Duration::from_millis(20),
                jitter_ratio: 0.2,
            },
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            jitter_ratio: 0.2,
        };

        assert_eq!(policy.base_delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.base_delay_for_attempt(9), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = BackoffPolicy::default();
        let base = Duration::from_secs(10);
        let close = |a: Duration, b: Duration| {
            let diff = if a > b { a - b } else { b - a };
            diff < Duration::from_millis(1)
        };
        assert!(close(policy.jittered(base, -1.0), Duration::from_secs(8)));
        assert!(close(policy.jittered(base, 1.0), Duration::from_secs(12)));
        for _ in 0..50 {
            let d = policy.delay_for_attempt(3);
            assert!(d >= Duration::from_millis(6_399) && d <= Duration::from_millis(9_601));
        }
    }

    #[tokio::test]
    async fn persistent_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new("flaky", fast_config(3)).unwrap();
        let err = fetcher
            .fetch(&format!("{}/search", server.uri()))
            .await
            .unwrap_err();
        match err {
            FetchError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new("strict", fast_config(3)).unwrap();
        let err = fetcher
            .fetch(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new("recovering", fast_config(3)).unwrap();
        let page = fetcher.fetch(&format!("{}/page", server.uri())).await.unwrap();
        assert_eq!(page.attempts, 2);
        assert_eq!(page.body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn rotates_user_agents_and_spaces_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut config = fast_config(0);
        config.min_interval = Duration::from_millis(120);
        let fetcher = RateLimitedFetcher::new("polite", config).unwrap();

        let started = Instant::now();
        for i in 0..3 {
            fetcher
                .fetch(&format!("{}/p{i}", server.uri()))
                .await
                .unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(240));

        let agents: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.headers.get("user-agent"))
            .filter_map(|v| v.to_str().ok().map(ToString::to_string))
            .collect();
        assert_eq!(agents, vec!["agent-a", "agent-b", "agent-a"]);
    }
}
