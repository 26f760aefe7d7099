//! Health probing - Waiting for an engine to answer its health check

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Path appended to the engine base URL
pub const HEALTH_CHECK_PATH: &str = "/api/__health_check";

/// Exact body of a healthy reply
pub const HEALTHY_BODY: &str = "ok";

/// Delay between probe attempts unless configured otherwise
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Full health check URL for an engine base URL
pub fn health_check_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), HEALTH_CHECK_PATH)
}

/// A single health check against an engine
pub trait HealthProbe: Send + Sync + 'static {
    /// `true` when the engine at `base_url` reports healthy
    fn probe(&self, base_url: &str) -> impl Future<Output = bool> + Send;
}

/// Probes the engine over HTTP
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Create a probe whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, base_url: &str) -> bool {
        let url = health_check_url(base_url);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                trace!("Health check request to {} failed: {}", url, e);
                return false;
            }
        };

        match response.text().await {
            Ok(body) => body == HEALTHY_BODY,
            Err(e) => {
                trace!("Failed to read health check body from {}: {}", url, e);
                false
            }
        }
    }
}

/// Fixed-interval retry policy for health probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between two attempts
    pub interval: Duration,
    /// Give up after this many attempts (`None` = never)
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed (`None` = never)
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PROBE_INTERVAL,
            max_attempts: None,
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow `attempts` failed ones
    pub fn allows_retry(&self, attempts: u32, elapsed: Duration) -> bool {
        let under_attempts = self.max_attempts.map_or(true, |max| attempts < max);
        let under_deadline = self
            .deadline
            .map_or(true, |deadline| elapsed + self.interval <= deadline);
        under_attempts && under_deadline
    }
}

/// How a probe loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The engine answered `ok` on attempt `attempts`
    Healthy { attempts: u32 },
    /// The policy ran out before the engine became healthy
    Exhausted { attempts: u32 },
    /// The token was cancelled
    Cancelled,
}

/// Probe `base_url` until it is healthy, the policy gives up, or `cancel`
/// fires. Cancellation is observed during a request as well as between them.
pub async fn wait_until_healthy<P: HealthProbe>(
    probe: &P,
    base_url: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts = attempts.saturating_add(1);
        let healthy = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            healthy = probe.probe(base_url) => healthy,
        };

        if healthy {
            debug!("Engine at {} healthy after {} attempt(s)", base_url, attempts);
            return ProbeOutcome::Healthy { attempts };
        }

        if !policy.allows_retry(attempts, started.elapsed()) {
            return ProbeOutcome::Exhausted { attempts };
        }
        debug!("Engine at {} not ready (attempt {})", base_url, attempts);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProbe;
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn health_url_is_appended_to_base() {
        assert_eq!(
            health_check_url("http://localhost:3000/signin"),
            "http://localhost:3000/signin/api/__health_check"
        );
        assert_eq!(
            health_check_url("http://h:9/"),
            "http://h:9/api/__health_check"
        );
    }

    #[test]
    fn default_policy_retries_forever() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval, Duration::from_millis(500));
        assert!(policy.allows_retry(u32::MAX - 1, Duration::from_secs(86_400)));
    }

    #[test]
    fn bounded_policy_stops_at_limits() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            deadline: Some(Duration::from_secs(2)),
            ..RetryPolicy::default()
        };
        assert!(policy.allows_retry(2, Duration::from_secs(1)));
        assert!(!policy.allows_retry(3, Duration::ZERO));
        assert!(!policy.allows_retry(1, Duration::from_millis(1_600)));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_healthy_on_third_attempt_with_fixed_spacing() {
        let probe = ScriptedProbe::healthy_after(2);
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let outcome =
            wait_until_healthy(&probe, "http://e", RetryPolicy::default(), &cancel).await;

        assert_eq!(outcome, ProbeOutcome::Healthy { attempts: 3 });
        let calls = probe.calls();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_attempts_run_out() {
        let probe = ScriptedProbe::never_healthy();
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: Some(4),
            ..RetryPolicy::default()
        };

        let outcome = wait_until_healthy(&probe, "http://e", policy, &cancel).await;

        assert_eq!(outcome, ProbeOutcome::Exhausted { attempts: 4 });
        assert_eq!(probe.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_an_unbounded_loop() {
        let probe = std::sync::Arc::new(ScriptedProbe::never_healthy());
        let cancel = CancellationToken::new();

        let task = {
            let probe = probe.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                wait_until_healthy(&*probe, "http://e", RetryPolicy::default(), &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(1_750)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), ProbeOutcome::Cancelled);
        assert_eq!(probe.calls().len(), 4);
    }

    /// Serve `bodies` in order, one connection each, then stop accepting
    async fn serve_bodies(bodies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        format!("http://{addr}/signin")
    }

    #[tokio::test]
    async fn http_probe_requires_exact_ok_body() {
        let base = serve_bodies(vec!["starting", "ok\n", "ok"]).await;
        let probe = HttpHealthProbe::new(Duration::from_secs(2)).unwrap();

        assert!(!probe.probe(&base).await);
        assert!(!probe.probe(&base).await);
        assert!(probe.probe(&base).await);
    }

    #[tokio::test]
    async fn http_probe_treats_connection_errors_as_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpHealthProbe::new(Duration::from_millis(500)).unwrap();
        assert!(!probe.probe(&format!("http://{addr}")).await);
    }

    #[tokio::test]
    async fn http_probe_loop_waits_for_ready_server() {
        let base = serve_bodies(vec!["", "not yet", "ok"]).await;
        let probe = HttpHealthProbe::new(Duration::from_secs(2)).unwrap();
        let policy = RetryPolicy {
            interval: Duration::from_millis(20),
            ..RetryPolicy::default()
        };

        let outcome = wait_until_healthy(&probe, &base, policy, &CancellationToken::new()).await;
        assert_eq!(outcome, ProbeOutcome::Healthy { attempts: 3 });
    }
}
