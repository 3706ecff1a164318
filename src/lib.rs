//! # GPT Bridge
//!
//! The streaming network layer shared by chat-completion gateway adapters.
//!
//! ## Overview
//!
//! Every upstream integration needs the same plumbing:
//! - **Connections** - TLS to the upstream, directly or through an HTTP `CONNECT` proxy
//! - **Streaming** - send one request, validate the head, forward body fragments as they decode
//! - **Recovery** - reconnect once when a server hangs up right after accepting a request
//! - **Delivery** - a bounded, cancellable channel between the network and the consumer
//! - **Sessions** - a short-lived pool of anti-bot cookies
//! - **Offload** - a worker pool for upstreams driven by a blocking HTTP client
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gpt_bridge::{BridgeConfig, Establisher, HttpRequest, channel, stream_to_channel};
//! use std::sync::Arc;
//!
//! # async fn run() -> gpt_bridge::Result<()> {
//! let config = BridgeConfig::from_env()?;
//! let establisher = Arc::new(Establisher::from_config(&config.network)?);
//! let endpoint = establisher.endpoint("chat.example.com", 443);
//!
//! let request = HttpRequest::post("chat.example.com", "/api/chat")
//!     .json(&serde_json::json!({"prompt": "hello", "stream": true}))?;
//!
//! let (tx, mut rx) = channel(config.channel.capacity);
//! tokio::spawn(async move { stream_to_channel(&endpoint, &request, 200, tx).await });
//!
//! while let Some(item) = rx.recv().await {
//!     print!("{}", String::from_utf8_lossy(&item?));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`proxy`] - Proxy URL parsing
//! - [`net`] - Connection establishment, tunneling and TLS
//! - [`http`] - HTTP/1.1 request encoding and response decoding
//! - [`driver`] - Request driving with the one-shot reconnect
//! - [`channel`] - Backpressured fragment channel
//! - [`session`] - Session token pool
//! - [`offload`] - Blocking-client worker pool
//! - [`streaming`] - Line and JSON framing helpers

pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod http;
pub mod metrics;
pub mod net;
pub mod offload;
pub mod proxy;
pub mod session;
pub mod streaming;

pub use channel::{ChannelState, FragmentReceiver, FragmentSender, StreamItem, channel};
pub use config::BridgeConfig;
pub use driver::{
    DriveSummary, HttpResponse, MAX_RECONNECTS, drive, drive_with_reconnect, fetch_response,
    stream_to_channel,
};
pub use error::{BridgeError, ConnectStage, Result};
pub use http::{HttpRequest, ResponseHead, encode_query};
pub use net::{Connector, Endpoint, Establisher, Transport, establish};
pub use offload::{BlockingClient, BlockingOffload};
pub use proxy::ProxySpec;
pub use session::{SessionPool, SessionRegistry, probe_session_token};
