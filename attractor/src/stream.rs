//! Streaming event bus between subprocess adapters and the engine.
//!
//! A [`ChanStream`] is a bounded single-producer / single-consumer channel
//! with explicit lifecycle: the producer calls [`ChanStream::send`] for each
//! event and [`ChanStream::close_send`] exactly once when the source
//! exhausts; the consumer reads [`ChanStream::events`] and may call
//! [`ChanStream::close`] at any time to abandon the stream. Delivery is
//! best-effort: once the consumer is closing, parked sends drop their
//! events instead of blocking.

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub const STREAM_BUFFER: usize = 128;

/// Kind discriminator for stream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    /// A structured event emitted by the provider CLI (one stream-json line).
    ProviderEvent,
    /// A line of subprocess stderr, forwarded for observability.
    Stderr,
    /// The adapter finished; no further events follow.
    Completed,
}

#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub raw: FxHashMap<String, Value>,
}

impl StreamEvent {
    pub fn provider(raw: FxHashMap<String, Value>) -> Self {
        Self {
            kind: StreamEventKind::ProviderEvent,
            raw,
        }
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        let mut raw = FxHashMap::default();
        raw.insert("line".to_string(), Value::String(line.into()));
        Self {
            kind: StreamEventKind::Stderr,
            raw,
        }
    }

    pub fn completed() -> Self {
        Self {
            kind: StreamEventKind::Completed,
            raw: FxHashMap::default(),
        }
    }
}

pub struct ChanStream {
    sender: parking_lot::Mutex<Option<mpsc::Sender<StreamEvent>>>,
    receiver: parking_lot::Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    cancel: CancellationToken,
    closing: CancellationToken,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl ChanStream {
    /// `cancel` is the producer's cancellation token; [`close`](Self::close)
    /// fires it so the adapter stops pumping its subprocess.
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            sender: parking_lot::Mutex::new(Some(tx)),
            receiver: parking_lot::Mutex::new(Some(rx)),
            cancel,
            closing: CancellationToken::new(),
            done_tx,
            done_rx,
        }
    }

    /// Take the consumer side. Exactly one consumer reads the stream.
    ///
    /// # Panics
    /// Panics if called twice.
    pub fn events(&self) -> mpsc::Receiver<StreamEvent> {
        self.receiver
            .lock()
            .take()
            .expect("ChanStream::events called twice")
    }

    /// Publish an event, dropping it if the stream is closed or closing.
    pub async fn send(&self, ev: StreamEvent) {
        if *self.done_rx.borrow() || self.closing.is_cancelled() {
            return;
        }
        let Some(tx) = self.sender.lock().as_ref().cloned() else {
            return;
        };
        tokio::select! {
            res = tx.send(ev) => {
                // Receiver dropped: best-effort delivery, treat as a drop.
                let _ = res;
            }
            _ = self.closing.cancelled() => {}
        }
    }

    /// Mark the producer side finished. Called exactly once by the producer
    /// when the source exhausts; closes the events channel.
    pub fn close_send(&self) {
        let tx = self.sender.lock().take();
        drop(tx);
        self.done_tx.send_replace(true);
    }

    /// Abandon the stream from the consumer side: cancels the producer's
    /// context, unblocks any parked send, and waits until
    /// [`close_send`](Self::close_send) has run so all resources are
    /// released.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.closing.cancel();
        let mut done = self.done_rx.clone();
        // wait_for returns immediately when the latch is already set
        let _ = done.wait_for(|d| *d).await;
    }
}
