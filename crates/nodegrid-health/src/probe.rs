//! Reachability probes.
//!
//! Every probe is bounded by a timeout; a timeout counts as
//! [`ProbeResult::Failed`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use nodegrid_core::{HealthPolicy, ProbeKind};

use crate::checker::ProbeResult;

/// Where to probe a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub node: String,
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(node: &str, host: &str, port: u16) -> Self {
        Self {
            node: node.to_string(),
            host: host.to_string(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Probes a node's reachability.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult;
}

/// Build the prober configured by a health policy.
pub fn prober_for(policy: &HealthPolicy) -> Arc<dyn Prober> {
    match &policy.probe {
        ProbeKind::Tcp => Arc::new(TcpProber::new(policy.timeout)),
        ProbeKind::Http { path } => Arc::new(HttpProber::new(path, policy.timeout)),
    }
}

/// Healthy when a TCP connection to the target is accepted.
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        let address = target.address();
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&address)).await {
            Ok(Ok(_)) => ProbeResult::Healthy,
            Ok(Err(e)) => {
                debug!(node = %target.node, %address, error = %e, "tcp probe refused");
                ProbeResult::Failed
            }
            Err(_) => {
                debug!(node = %target.node, %address, "tcp probe timed out");
                ProbeResult::Failed
            }
        }
    }
}

/// Healthy when `GET <path>` returns 2xx.
#[derive(Debug, Clone)]
pub struct HttpProber {
    path: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        http_probe(&target.address(), &self.path, self.timeout).await
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "http probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "http probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "nodegrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "http probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "http probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "http probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "http probe timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
        });
        port
    }

    #[tokio::test]
    async fn tcp_probe_to_listener_is_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = TcpProber::new(Duration::from_secs(1));
        let result = prober.probe(&ProbeTarget::new("n", "127.0.0.1", port)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn tcp_probe_to_closed_port_fails() {
        let prober = TcpProber::new(Duration::from_millis(200));
        let result = prober.probe(&ProbeTarget::new("n", "127.0.0.1", 1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn http_probe_accepts_2xx() {
        let port = serve_once("HTTP/1.1 200 OK").await;
        let result = http_probe(&format!("127.0.0.1:{port}"), "/", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn http_probe_flags_non_2xx() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let result = http_probe(&format!("127.0.0.1:{port}"), "/", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_fails() {
        let result = http_probe("127.0.0.1:1", "/", Duration::from_millis(200)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[test]
    fn prober_for_builds_from_policy() {
        let mut policy = HealthPolicy::default();
        let _tcp = prober_for(&policy);
        policy.probe = ProbeKind::Http {
            path: "/json".to_string(),
        };
        let _http = prober_for(&policy);
    }
}
