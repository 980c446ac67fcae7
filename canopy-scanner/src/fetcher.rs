use crate::error::{Result, ScanError};
use crate::identity::Identity;
use crate::outcome::{FetchOutcome, FetchReport, FetchResult};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// How a target has to be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMode {
    /// Plain GET, used for the listing API and server-rendered pages.
    Http,
    /// Driven-browser navigation; the page counts as loaded once
    /// `ready_selector` is present in the DOM.
    Rendered { ready_selector: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    pub mode: FetchMode,
}

impl Target {
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: FetchMode::Http,
        }
    }

    pub fn rendered(url: impl Into<String>, ready_selector: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: FetchMode::Rendered {
                ready_selector: ready_selector.into(),
            },
        }
    }
}

/// One network attempt, classified. Implementations never retry on their own.
#[async_trait]
pub trait Transport: Send {
    async fn attempt(&mut self, target: &Target) -> FetchOutcome;

    /// Release whatever the transport holds (browser process, sockets).
    async fn close(&mut self) {}
}

/// Plain HTTP transport. One client per worker, carrying that worker's
/// identity as default headers.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(identity: &Identity, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .default_headers(identity.header_map())
            .timeout(timeout)
            .connect_timeout(timeout / 2)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ScanError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn attempt(&mut self, target: &Target) -> FetchOutcome {
        debug!("GET {}", target.url);

        let response = match self.client.get(&target.url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return FetchOutcome::Timeout,
            Err(e) => return FetchOutcome::NetworkError(e.to_string()),
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => FetchOutcome::from_response(status, body),
            Err(e) if e.is_timeout() => FetchOutcome::Timeout,
            Err(e) => FetchOutcome::NetworkError(e.to_string()),
        }
    }
}

/// Waits applied before each attempt; the first entry is normally zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(schedule: Vec<Duration>) -> Self {
        let schedule = if schedule.is_empty() {
            vec![Duration::ZERO]
        } else {
            schedule
        };
        Self { schedule }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().map(|s| Duration::from_secs(*s)).collect())
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }

    pub fn max_attempts(&self) -> usize {
        self.schedule.len()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(&[0, 5, 15])
    }
}

/// Uniform random pause taken after every successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoliteDelay {
    pub min: Duration,
    pub max: Duration,
}

impl PoliteDelay {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self, rng: &mut impl Rng) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rng.random_range(min_ms..=max_ms))
    }
}

impl Default for PoliteDelay {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500), Duration::from_millis(3500))
    }
}

/// Applies the retry schedule, per-attempt timeout and post-success delay
/// around a [`Transport`].
pub struct Fetcher<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    delay: PoliteDelay,
    attempt_timeout: Duration,
    rng: StdRng,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            delay: PoliteDelay::default(),
            attempt_timeout: Duration::from_secs(30),
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_delay(mut self, delay: PoliteDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub async fn fetch(&mut self, target: &Target) -> FetchReport {
        let schedule = self.policy.schedule.clone();
        let mut attempts = 0;
        let mut last = FetchOutcome::NetworkError("no attempt made".to_string());

        for wait in schedule {
            if !wait.is_zero() {
                debug!("Backing off {:?} before retrying {}", wait, target.url);
                tokio::time::sleep(wait).await;
            }

            attempts += 1;
            let outcome =
                match tokio::time::timeout(self.attempt_timeout, self.transport.attempt(target))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => FetchOutcome::Timeout,
                };

            match outcome {
                FetchOutcome::Success {
                    content,
                    fetched_at,
                } => {
                    self.cool_down().await;
                    return FetchReport {
                        result: FetchResult::Success {
                            content,
                            fetched_at,
                        },
                        attempts,
                    };
                }
                FetchOutcome::NotFound => {
                    debug!("{} not found, not retrying", target.url);
                    return FetchReport {
                        result: FetchResult::NotFound,
                        attempts,
                    };
                }
                other => {
                    warn!(
                        "Attempt {}/{} for {} failed: {}",
                        attempts,
                        self.policy.max_attempts(),
                        target.url,
                        other.label()
                    );
                    last = other;
                }
            }
        }

        FetchReport {
            result: FetchResult::Failed(last),
            attempts,
        }
    }

    async fn cool_down(&mut self) {
        let pause = self.delay.sample(&mut self.rng);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Plays back a fixed list of outcomes and records when each attempt ran.
    struct ScriptedTransport {
        script: VecDeque<FetchOutcome>,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<FetchOutcome>) -> (Self, Arc<Mutex<Vec<Instant>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    script: script.into(),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn attempt(&mut self, _target: &Target) -> FetchOutcome {
            self.calls.lock().unwrap().push(Instant::now());
            self.script.pop_front().unwrap_or(FetchOutcome::ServerError(500))
        }
    }

    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn attempt(&mut self, _target: &Target) -> FetchOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            FetchOutcome::success(String::new())
        }
    }

    fn target() -> Target {
        Target::http("http://example.test/taxa/1")
    }

    fn within(actual: Duration, expected: Duration) -> bool {
        actual >= expected && actual < expected + Duration::from_millis(50)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_is_followed() {
        let (transport, calls) = ScriptedTransport::new(vec![
            FetchOutcome::RateLimited,
            FetchOutcome::RateLimited,
            FetchOutcome::success("<html></html>".to_string()),
        ]);
        let mut fetcher = Fetcher::new(transport).with_delay(PoliteDelay::none());

        let report = fetcher.fetch(&target()).await;

        assert!(report.is_success());
        assert_eq!(report.attempts, 3);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(within(calls[1] - calls[0], Duration::from_secs(5)));
        assert!(within(calls[2] - calls[1], Duration::from_secs(15)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_short_circuits() {
        let (transport, calls) = ScriptedTransport::new(vec![FetchOutcome::NotFound]);
        let mut fetcher = Fetcher::new(transport).with_delay(PoliteDelay::none());

        let report = fetcher.fetch(&target()).await;

        assert_eq!(report.result, FetchResult::NotFound);
        assert_eq!(report.attempts, 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_schedule_fails_with_last_outcome() {
        let (transport, calls) = ScriptedTransport::new(vec![
            FetchOutcome::ServerError(502),
            FetchOutcome::NetworkError("reset".to_string()),
            FetchOutcome::ServerError(503),
        ]);
        let mut fetcher = Fetcher::new(transport).with_delay(PoliteDelay::none());

        let report = fetcher.fetch(&target()).await;

        assert_eq!(
            report.result,
            FetchResult::Failed(FetchOutcome::ServerError(503))
        );
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let mut fetcher = Fetcher::new(HangingTransport)
            .with_policy(RetryPolicy::from_secs(&[0, 1]))
            .with_attempt_timeout(Duration::from_secs(2))
            .with_delay(PoliteDelay::none());

        let report = fetcher.fetch(&target()).await;

        assert_eq!(report.result, FetchResult::Failed(FetchOutcome::Timeout));
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_followed_by_polite_delay() {
        let (transport, _calls) =
            ScriptedTransport::new(vec![FetchOutcome::success("ok".to_string())]);
        let mut fetcher = Fetcher::new(transport)
            .with_delay(PoliteDelay::new(
                Duration::from_millis(1500),
                Duration::from_millis(3500),
            ))
            .with_seed(7);

        let start = Instant::now();
        fetcher.fetch(&target()).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed <= Duration::from_millis(3550));
    }

    #[test]
    fn test_polite_delay_sample_bounds() {
        let delay = PoliteDelay::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let pause = delay.sample(&mut rng);
            assert!(pause >= delay.min && pause <= delay.max);
        }
        assert_eq!(PoliteDelay::none().sample(&mut rng), Duration::ZERO);
    }

    #[test]
    fn test_empty_schedule_still_attempts_once() {
        assert_eq!(RetryPolicy::new(Vec::new()).max_attempts(), 1);
    }
}
