//! Probe seam and the health gate used between rollout phases.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::checker::{HealthCheckConfig, HealthTracker, ProbeResult};
use crate::error::{HealthError, HealthResult};

/// Executes one health probe against a slot backend.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `{backend_url}{endpoint}`. Implementations should honour
    /// `timeout`; the gate enforces it regardless.
    async fn probe(&self, backend_url: &str, endpoint: &str, timeout: Duration) -> ProbeResult;
}

/// Plain HTTP/1.1 `GET` probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProbe;

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, backend_url: &str, endpoint: &str, timeout: Duration) -> ProbeResult {
        let url = format!("{}{}", backend_url.trim_end_matches('/'), endpoint);
        http_probe(&url, timeout).await
    }
}

/// Perform an HTTP health probe against a URL.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the URL is unusable, the connection fails or it times out.
pub async fn http_probe(url: &str, timeout: Duration) -> ProbeResult {
    let uri: http::Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!(error = %e, %url, "health probe url invalid");
            return ProbeResult::Failed;
        }
    };
    if uri.scheme_str().is_some_and(|s| s != "http") {
        debug!(%url, "health probe supports plain http only");
        return ProbeResult::Failed;
    }
    let Some(host) = uri.host() else {
        debug!(%url, "health probe url has no host");
        return ProbeResult::Failed;
    };
    let address = format!("{}:{}", host, uri.port_u16().unwrap_or(80));
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %url, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %url, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path.as_str())
            .header("host", address.as_str())
            .header("user-agent", "slotway-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %url, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %url, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %url, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%url, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Repeatedly probes one slot until it proves healthy or unhealthy.
pub struct HealthGate {
    probe: Arc<dyn HealthProbe>,
    endpoint: String,
    interval: Duration,
    timeout: Duration,
    unhealthy_threshold: u32,
    success_threshold: u32,
}

impl HealthGate {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        config: &HealthCheckConfig,
        success_threshold: u32,
    ) -> HealthResult<Self> {
        config.validate()?;
        Ok(Self {
            probe,
            endpoint: config.endpoint.clone(),
            interval: config.interval()?,
            timeout: config.timeout()?,
            unhealthy_threshold: config.unhealthy_threshold,
            success_threshold: success_threshold.max(1),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe `backend_url` until `success_threshold` consecutive successes
    /// (returns the number of probes sent) or `unhealthy_threshold`
    /// consecutive failures (returns `HealthCheckFailed`).
    pub async fn check(&self, backend_url: &str) -> HealthResult<u32> {
        let mut tracker = HealthTracker::new(self.unhealthy_threshold, self.success_threshold);
        let mut probes = 0u32;

        loop {
            let result = tokio::time::timeout(
                self.timeout,
                self.probe.probe(backend_url, &self.endpoint, self.timeout),
            )
            .await
            .unwrap_or(ProbeResult::Failed);
            probes += 1;
            tracker.record(result);

            if tracker.passed() {
                debug!(target = %backend_url, probes, "health gate passed");
                return Ok(probes);
            }
            if tracker.failed() {
                return Err(HealthError::HealthCheckFailed {
                    target: format!("{}{}", backend_url.trim_end_matches('/'), self.endpoint),
                    failures: tracker.consecutive_failures(),
                    reason: result.to_string(),
                });
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Returns scripted results, then `Healthy` once the script runs out.
    struct ScriptedProbe {
        script: Mutex<VecDeque<ProbeResult>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        fn new(script: &[ProbeResult]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, backend_url: &str, endpoint: &str, _timeout: Duration) -> ProbeResult {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{backend_url}{endpoint}"));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProbeResult::Healthy)
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _: &str, _: &str, _: Duration) -> ProbeResult {
            std::future::pending().await
        }
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            endpoint: "/healthz".to_string(),
            interval: "1s".to_string(),
            timeout: "500ms".to_string(),
            unhealthy_threshold: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn passes_on_first_success() {
        let probe = ScriptedProbe::new(&[]);
        let gate = HealthGate::new(probe.clone(), &config(), 1).unwrap();

        assert_eq!(gate.check("http://cart-green").await.unwrap(), 1);
        assert_eq!(probe.calls.lock().unwrap()[0], "http://cart-green/healthz");
    }

    #[tokio::test(start_paused = true)]
    async fn success_threshold_needs_consecutive_successes() {
        let probe = ScriptedProbe::new(&[
            ProbeResult::Healthy,
            ProbeResult::Failed,
            ProbeResult::Healthy,
            ProbeResult::Healthy,
        ]);
        let gate = HealthGate::new(probe, &config(), 2).unwrap();
        assert_eq!(gate.check("http://cart-green").await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_consecutive_failures() {
        let probe = ScriptedProbe::new(&[
            ProbeResult::Unhealthy,
            ProbeResult::Failed,
            ProbeResult::Unhealthy,
        ]);
        let gate = HealthGate::new(probe, &config(), 1).unwrap();

        match gate.check("http://cart-green").await {
            Err(HealthError::HealthCheckFailed {
                target, failures, ..
            }) => {
                assert_eq!(target, "http://cart-green/healthz");
                assert_eq!(failures, 3);
            }
            other => panic!("expected HealthCheckFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_times_out_as_failure() {
        let gate = HealthGate::new(Arc::new(HangingProbe), &config(), 1).unwrap();
        assert!(gate.check("http://cart-green").await.is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = HealthCheckConfig {
            interval: "whenever".to_string(),
            ..config()
        };
        assert!(HealthGate::new(Arc::new(HttpProbe), &bad, 1).is_err());
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_returns_failed() {
        let result = http_probe("http://127.0.0.1:1/health", Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn http_probe_rejects_https() {
        let result = http_probe("https://127.0.0.1:1/health", Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    async fn serve_once(status_line: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_probe_reads_status() {
        let base = serve_once("HTTP/1.1 200 OK").await;
        let ok = HttpProbe.probe(&base, "/health", Duration::from_secs(2)).await;
        assert_eq!(ok, ProbeResult::Healthy);

        let base = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let down = HttpProbe.probe(&base, "/health", Duration::from_secs(2)).await;
        assert_eq!(down, ProbeResult::Unhealthy);
    }
}
