//! `StreamParser`: turns an unbounded sequence of arbitrary-sized byte
//! chunks into the server's greeting line (emitted once) followed by a
//! sequence of complete, terminator-delimited AMI messages.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::record::{EOR, TERMINATOR};

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Internal framing state machine. Kept free of any async/channel concerns
/// so it can be unit-tested with plain byte slices.
struct ParserState {
    /// Accumulates bytes until the greeting's `\r\n` is found. Kept
    /// separate from `pending` so that a greeting split across many tiny
    /// chunks (e.g. byte-at-a-time feeding) is still recognized correctly,
    /// rather than assuming — as the reference implementation does — that
    /// the whole greeting line always lands in a single chunk.
    greeting_buf: Option<Vec<u8>>,
    pending: Vec<u8>,
}

impl ParserState {
    fn new() -> Self {
        Self {
            greeting_buf: Some(Vec::new()),
            pending: Vec::new(),
        }
    }

    fn feed_chunk(
        &mut self,
        chunk: &[u8],
        on_version: &dyn Fn(String),
        on_message: &dyn Fn(Vec<u8>),
    ) {
        if let Some(greeting_buf) = self.greeting_buf.as_mut() {
            greeting_buf.extend_from_slice(chunk);
            let Some(eor_at) = find(greeting_buf, EOR.as_bytes(), 0) else {
                return;
            };
            let version = String::from_utf8_lossy(&greeting_buf[..eor_at]).into_owned();
            let remainder = greeting_buf.split_off(eor_at + EOR.len());
            self.greeting_buf = None;
            tracing::debug!(version = %version, "ami greeting framed");
            on_version(version);
            self.pending = remainder;
            self.drain_messages(0, on_message);
            return;
        }

        let before_len = self.pending.len();
        self.pending.extend_from_slice(chunk);
        let scan_start = before_len.saturating_sub(TERMINATOR.len() - 1);
        self.drain_messages(scan_start, on_message);
    }

    fn drain_messages(&mut self, mut scan_start: usize, on_message: &dyn Fn(Vec<u8>)) {
        while let Some(pos) = find(&self.pending, TERMINATOR.as_bytes(), scan_start) {
            let end = pos + TERMINATOR.len();
            let message: Vec<u8> = self.pending.drain(..end).collect();
            tracing::debug!(bytes = message.len(), "ami message framed");
            on_message(message);
            scan_start = 0;
        }
    }
}

/// Frames a byte stream into AMI messages on a dedicated worker task.
///
/// `feed` never blocks: it hands the chunk to the worker over an unbounded
/// channel and returns immediately.
pub struct StreamParser {
    chunk_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamParser {
    pub fn spawn<V, M>(on_version: V, on_message: M) -> Self
    where
        V: Fn(String) + Send + 'static,
        M: Fn(Vec<u8>) + Send + 'static,
    {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let worker = tokio::spawn(
            async move {
                let mut state = ParserState::new();
                while let Some(chunk) = chunk_rx.recv().await {
                    state.feed_chunk(&chunk, &on_version, &on_message);
                }
                if !state.pending.is_empty() {
                    tracing::warn!(
                        bytes = state.pending.len(),
                        "ami parser shut down with an incomplete trailing message, discarding"
                    );
                }
            }
            .instrument(tracing::info_span!("ami_parser")),
        );

        Self {
            chunk_tx: Mutex::new(Some(chunk_tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Queue a chunk of raw bytes for framing. Non-blocking.
    pub fn feed(&self, chunk: Vec<u8>) {
        if let Some(tx) = self.chunk_tx.lock().unwrap().as_ref() {
            let _ = tx.send(chunk);
        }
    }

    /// Stop accepting new chunks and wait for the worker to drain whatever
    /// is already queued.
    pub async fn shutdown(&self) {
        self.chunk_tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}
