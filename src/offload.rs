//! Offload for upstreams driven by a blocking HTTP client
//!
//! Blocking calls never run on the async scheduler. Each job waits for a
//! permit from a pool sized at twice the configured worker count, then runs
//! on a blocking thread. Results travel back exclusively through the fragment
//! channel.

use bytes::Bytes;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::FragmentSender;
use crate::config::NetworkConfig;
use crate::error::{BridgeError, Result};
use crate::http::HttpRequest;
use crate::metrics::BRIDGE_METRICS;

const MAX_REDIRECTS: usize = 20;
const READ_CHUNK_SIZE: usize = 8192;

/// Bounded pool of blocking workers
#[derive(Debug, Clone)]
pub struct BlockingOffload {
    permits: Arc<Semaphore>,
    threads: usize,
}

impl BlockingOffload {
    /// Pool with `2 * work_thread_num` concurrent workers
    pub fn new(work_thread_num: usize) -> Self {
        let threads = work_thread_num.max(1) * 2;
        info!(threads, "blocking offload pool ready");
        Self {
            permits: Arc::new(Semaphore::new(threads)),
            threads,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a blocking worker.
    ///
    /// The job streams into the sender it is given. If it fails, its error is
    /// sent as the terminal item. The channel is closed once the job returns.
    pub fn spawn<F>(&self, mut sender: FragmentSender, job: F) -> JoinHandle<()>
    where
        F: FnOnce(&FragmentSender) -> Result<()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    sender
                        .send_error(BridgeError::Upstream("worker pool is shut down".into()))
                        .await;
                    sender.close();
                    return;
                }
            };

            let worker = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                if let Err(e) = job(&sender) {
                    warn!(error = %e, "blocking job failed");
                    sender.send_error_blocking(e);
                }
                sender.close();
            });

            // a panicking job drops its sender, which closes the channel
            if let Err(e) = worker.await {
                error!(error = %e, "blocking worker panicked");
            }
        })
    }

    /// Stream `request` through `client` on a blocking worker
    pub fn stream(
        &self,
        client: BlockingClient,
        request: HttpRequest,
        expected_status: u16,
        sender: FragmentSender,
    ) -> JoinHandle<()> {
        self.spawn(sender, move |sender| {
            client.stream(&request, expected_status, sender)
        })
    }

    /// Stop handing out permits; queued and future jobs fail immediately
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

/// Blocking HTTP client settings mirroring the async path
#[derive(Debug, Clone)]
pub struct BlockingClient {
    config: NetworkConfig,
    scheme: String,
}

impl BlockingClient {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            scheme: "https".to_string(),
        }
    }

    /// Override the URL scheme used to reach the upstream
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn url(&self, request: &HttpRequest) -> String {
        let path = if request.path.is_empty() {
            "/"
        } else {
            &request.path
        };
        format!("{}://{}{}", self.scheme, request.host, path)
    }

    /// Build the underlying client. Must run on a blocking thread.
    fn build(&self) -> Result<reqwest::blocking::Client> {
        let mut builder = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(self.config.connect_timeout())
            .timeout(self.config.request_timeout())
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS));

        if let Some(proxy) = self.config.proxy()? {
            let mut upstream =
                reqwest::Proxy::all(format!("{}://{}", proxy.scheme, proxy.authority()))
                    .map_err(upstream_error)?;
            if let Some(credentials) = &proxy.credentials {
                upstream = upstream.basic_auth(&credentials.username, &credentials.password);
            }
            builder = builder.proxy(upstream);
        } else {
            builder = builder.no_proxy();
        }

        builder.build().map_err(upstream_error)
    }

    /// Perform `request` and forward the body into `sender` as it is read.
    ///
    /// Returns early without error if the consumer closes the channel.
    pub fn stream(
        &self,
        request: &HttpRequest,
        expected_status: u16,
        sender: &FragmentSender,
    ) -> Result<()> {
        let client = self.build()?;
        let url = self.url(request);
        debug!(%url, method = %request.method, "blocking request");

        let mut response = client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone())
            .body(request.body.to_vec())
            .send()
            .map_err(upstream_error)?;

        let status = response.status();
        if status.as_u16() != expected_status {
            error!(status = status.as_u16(), %url, "unexpected http status");
            return Err(BridgeError::UnexpectedStatus {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| BridgeError::Upstream(format!("body read failed: {}", e)))?;
            if n == 0 {
                return Ok(());
            }
            BRIDGE_METRICS.record_fragment(n);
            if !sender.send_blocking(Ok(Bytes::copy_from_slice(&buf[..n]))) {
                debug!("consumer closed the channel, abandoning blocking response");
                return Ok(());
            }
        }
    }
}

fn upstream_error(e: reqwest::Error) -> BridgeError {
    BridgeError::Upstream(e.to_string())
}
