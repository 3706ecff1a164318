//! Bounded fragment channel between a network-driving producer and a consumer
//!
//! Carries `Result<Bytes, BridgeError>` items in FIFO order. Either side may
//! close; closing is idempotent. Once closed, sends are inert: they return
//! `false` immediately and the item is discarded. A consumer that closes can
//! still drain whatever was buffered before the close.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BridgeError;
use crate::metrics::BRIDGE_METRICS;

pub type StreamItem = Result<Bytes, BridgeError>;

/// Lifecycle of a channel as seen by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Producer may send, consumer may receive
    Open,
    /// No more sends accepted, buffered items still drainable
    Closing,
    /// Nothing left; `recv` returns `None`
    Closed,
}

/// Create a channel holding at most `capacity` undelivered items
pub fn channel(capacity: usize) -> (FragmentSender, FragmentReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FragmentSender { tx: Some(tx) }, FragmentReceiver { rx })
}

/// Producer half
#[derive(Debug)]
pub struct FragmentSender {
    tx: Option<mpsc::Sender<StreamItem>>,
}

impl FragmentSender {
    /// Send an item, waiting while the channel is full.
    ///
    /// Returns `false` without blocking if the channel is already closed.
    pub async fn send(&self, item: StreamItem) -> bool {
        let Some(tx) = &self.tx else {
            return Self::dropped(item);
        };
        match tx.send(item).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(item)) => Self::dropped(item),
        }
    }

    /// Blocking variant of [`send`](Self::send) for worker threads.
    ///
    /// Must not be called from within an async task.
    pub fn send_blocking(&self, item: StreamItem) -> bool {
        let Some(tx) = &self.tx else {
            return Self::dropped(item);
        };
        match tx.blocking_send(item) {
            Ok(()) => true,
            Err(mpsc::error::SendError(item)) => Self::dropped(item),
        }
    }

    /// Send a fragment of payload
    pub async fn send_fragment(&self, fragment: impl Into<Bytes>) -> bool {
        self.send(Ok(fragment.into())).await
    }

    /// Report a terminal error; the caller is expected to close afterwards
    pub async fn send_error(&self, error: BridgeError) -> bool {
        BRIDGE_METRICS.record_terminal_error();
        self.send(Err(error)).await
    }

    /// Blocking variant of [`send_error`](Self::send_error)
    pub fn send_error_blocking(&self, error: BridgeError) -> bool {
        BRIDGE_METRICS.record_terminal_error();
        self.send_blocking(Err(error))
    }

    /// Signal end of stream. Buffered items stay drainable.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!("fragment channel closed by producer");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    fn dropped(item: StreamItem) -> bool {
        BRIDGE_METRICS.record_dropped_send();
        match item {
            Ok(fragment) => debug!(len = fragment.len(), "channel closed, dropping fragment"),
            Err(e) => debug!(error = %e, "channel closed, dropping error"),
        }
        false
    }
}

/// Consumer half
#[derive(Debug)]
pub struct FragmentReceiver {
    rx: mpsc::Receiver<StreamItem>,
}

impl FragmentReceiver {
    /// Next item, or `None` once the channel is closed and drained
    pub async fn recv(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }

    /// Stop accepting new items. Pending and future sends become no-ops.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn state(&self) -> ChannelState {
        if !self.rx.is_closed() {
            ChannelState::Open
        } else if self.rx.is_empty() {
            ChannelState::Closed
        } else {
            ChannelState::Closing
        }
    }

    /// Drain to the end, splitting fragments from a terminal error.
    ///
    /// Items after the first error are not expected, and are ignored.
    pub async fn drain(mut self) -> (Vec<Bytes>, Option<BridgeError>) {
        let mut fragments = Vec::new();
        while let Some(item) = self.recv().await {
            match item {
                Ok(fragment) => fragments.push(fragment),
                Err(e) => return (fragments, Some(e)),
            }
        }
        (fragments, None)
    }
}

impl Stream for FragmentReceiver {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
