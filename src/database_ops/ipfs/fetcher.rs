use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response};
use tracing::{debug, warn};

const DEFAULT_BACKOFF: Duration = Duration::from_millis(1000);

/// GET with a per-attempt timeout and linear backoff between attempts.
///
/// A request is attempted once plus up to `max_retries` more times, sleeping
/// `backoff * attempt` after each failed attempt. Non-success statuses are retried
/// too; when attempts run out the last response is handed back as-is. `None`
/// means no attempt produced a response at all.
#[derive(Debug, Clone)]
pub struct RetryingFetcher {
    http: Client,
    backoff: Duration,
}

impl RetryingFetcher {
    pub fn with_client(http: Client) -> Self {
        Self {
            http,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    pub async fn fetch(&self, url: &str, timeout: Duration, max_retries: u32) -> Option<Response> {
        let attempts = max_retries + 1;
        let mut last_response: Option<Response> = None;
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.http.get(url).send()).await {
                Ok(Ok(resp)) if resp.status().is_success() => return Some(resp),
                Ok(Ok(resp)) => {
                    debug!(target = "fetch", url, attempt, status = %resp.status(), "non-success response");
                    last_response = Some(resp);
                }
                Ok(Err(err)) => {
                    debug!(target = "fetch", url, attempt, error = %err, "request failed");
                }
                Err(_) => {
                    debug!(target = "fetch", url, attempt, timeout_ms = timeout.as_millis() as u64, "request timed out");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }
        if last_response.is_none() {
            warn!(target = "fetch", url, attempts, "giving up: no response from upstream");
        }
        last_response
    }
}

/// Binary download used by asset migration.
#[async_trait]
pub trait BinaryFetch: Send + Sync {
    /// Body of a successful response, or `None` when the asset is unavailable.
    async fn fetch_binary(&self, url: &str, timeout: Duration, max_retries: u32)
        -> Option<Bytes>;
}

#[async_trait]
impl BinaryFetch for RetryingFetcher {
    async fn fetch_binary(
        &self,
        url: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Option<Bytes> {
        let resp = self.fetch(url, timeout, max_retries).await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(target = "fetch", url, status = %status, "asset unavailable");
            return None;
        }
        match resp.bytes().await {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(target = "fetch", url, error = %err, "failed to read asset body");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local_fetcher() -> RetryingFetcher {
        let http = Client::builder().no_proxy().build().unwrap();
        RetryingFetcher::with_client(http).with_backoff(Duration::from_millis(1))
    }

    /// Serves a fixed status to every connection and counts them.
    async fn serve_status(status_line: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let body = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                );
                let _ = sock.write_all(body.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{addr}/ipfs/QmTest"), hits)
    }

    #[test]
    fn backoff_is_linear_in_attempt_number() {
        let f = RetryingFetcher::with_client(Client::new());
        assert_eq!(f.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(f.backoff_delay(3), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn success_returns_on_first_attempt() {
        let (url, hits) = serve_status("200 OK").await;
        let body = local_fetcher()
            .fetch_binary(&url, Duration::from_secs(5), 3)
            .await;
        assert_eq!(body.as_deref(), Some(&b"ok"[..]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_success_is_retried_then_last_response_returned() {
        let (url, hits) = serve_status("503 Service Unavailable").await;
        let fetcher = local_fetcher();
        let resp = fetcher.fetch(&url, Duration::from_secs(5), 2).await;
        assert_eq!(resp.map(|r| r.status().as_u16()), Some(503));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(fetcher.fetch_binary(&url, Duration::from_secs(5), 0).await.is_none());
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_none() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let resp = local_fetcher()
            .fetch(&format!("http://{addr}/x"), Duration::from_millis(500), 2)
            .await;
        assert!(resp.is_none());
    }
}
