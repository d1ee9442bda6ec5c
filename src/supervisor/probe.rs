//! HTTP liveness probe for deployed servers

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Any answer below 500 means something is serving, even a 404
pub fn counts_as_alive(status: StatusCode) -> bool {
    status.as_u16() < 500
}

/// Bounded-timeout `GET /` against a local port
pub struct LivenessProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl LivenessProbe {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(timeout));

        // Probes are rare; never keep connections to servers that may be replaced
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client, timeout }
    }

    pub async fn is_alive(&self, port: u16) -> bool {
        let uri = format!("http://127.0.0.1:{}/", port);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "close")
            .header("User-Agent", concat!("sitedeploy/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let alive = counts_as_alive(response.status());
                debug!(port, status = response.status().as_u16(), alive, "Liveness probe answered");
                alive
            }
            Ok(Err(e)) => {
                debug!(port, error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                debug!(port, timeout_ms = self.timeout.as_millis() as u64, "Liveness probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a fixed status line on a random port, forever
    async fn serve_status(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status_line
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        port
    }

    #[test]
    fn test_counts_as_alive() {
        assert!(counts_as_alive(StatusCode::OK));
        assert!(counts_as_alive(StatusCode::TEMPORARY_REDIRECT));
        assert!(counts_as_alive(StatusCode::NOT_FOUND));
        assert!(!counts_as_alive(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!counts_as_alive(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_probe_ok_and_not_found_are_alive() {
        let probe = LivenessProbe::new(Duration::from_secs(1));
        assert!(probe.is_alive(serve_status("200 OK").await).await);
        assert!(probe.is_alive(serve_status("404 Not Found").await).await);
    }

    #[tokio::test]
    async fn test_probe_server_error_is_not_alive() {
        let probe = LivenessProbe::new(Duration::from_secs(1));
        assert!(!probe.is_alive(serve_status("503 Service Unavailable").await).await);
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_not_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = LivenessProbe::new(Duration::from_secs(1));
        assert!(!probe.is_alive(port).await);
    }

    #[tokio::test]
    async fn test_probe_silent_server_times_out() {
        // Accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let probe = LivenessProbe::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert!(!probe.is_alive(port).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
