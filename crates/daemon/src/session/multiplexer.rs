//! Session output multiplexer.
//!
//! Reads PTY output, decodes it to UTF-8 text and fans it out to every
//! attached connection. Each subscriber has a bounded queue; when a queue is
//! full the newest chunk is dropped for that subscriber only and counted, so
//! one slow connection never stalls the PTY or its peers. The next chunk that
//! fits carries the count of chunks lost just before it.
//!
//! The broadcaster also keeps two text rings: a scrollback that is replayed to
//! new subscribers, and a poll buffer drained by non-streaming readers.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Unique identifier for a subscriber.
pub type ClientId = u64;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Statistics about a subscriber's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Chunks queued successfully.
    pub messages_sent: u64,
    /// Chunks dropped because the queue was full.
    pub messages_dropped: u64,
    /// Whether the last send found the queue full.
    pub is_backpressured: bool,
}

/// One queued piece of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// UTF-8 text.
    pub data: Bytes,
    /// Chunks dropped for this subscriber between the previous chunk and this one.
    pub dropped_before: u64,
}

/// Sending half of one subscriber.
struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<OutputChunk>,
    stats: ClientStats,
    /// Drops not yet attached to a delivered chunk.
    pending_drops: u64,
}

impl ClientHandle {
    /// Queues a chunk without waiting. Returns true if queued.
    fn try_send(&mut self, data: Bytes) -> bool {
        let chunk = OutputChunk {
            data,
            dropped_before: self.pending_drops,
        };
        match self.tx.try_send(chunk) {
            Ok(()) => {
                self.pending_drops = 0;
                self.stats.messages_sent += 1;
                if self.stats.is_backpressured {
                    self.stats.is_backpressured = false;
                    tracing::debug!(client_id = self.id, "Client recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                self.pending_drops += 1;
                if !self.stats.is_backpressured {
                    self.stats.is_backpressured = true;
                    tracing::warn!(
                        client_id = self.id,
                        dropped = self.stats.messages_dropped,
                        "Client is backpressured, dropping output"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half handed to a connection.
///
/// Yields chunks in PTY production order. `recv` returns `None` once the
/// session's output has ended and the queue is drained.
pub struct OutputSubscription {
    id: ClientId,
    rx: mpsc::Receiver<OutputChunk>,
}

impl OutputSubscription {
    /// Returns the subscriber id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Waits for the next chunk.
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }
}

/// A bounded text buffer that discards its oldest characters first.
#[derive(Debug, Default)]
pub(crate) struct TextRing {
    buf: String,
    capacity: usize,
}

impl TextRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: String::new(),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.capacity {
            let cut = ceil_char_boundary(&self.buf, self.buf.len() - self.capacity);
            self.buf.drain(..cut);
        }
    }

    /// Removes and returns up to `max` bytes from the front.
    ///
    /// Never splits a character; returns at least one character when the
    /// buffer is non-empty and `max` is smaller than it.
    pub(crate) fn take(&mut self, max: usize) -> String {
        if max >= self.buf.len() {
            return std::mem::take(&mut self.buf);
        }
        let mut cut = floor_char_boundary(&self.buf, max);
        if cut == 0 && max > 0 {
            cut = ceil_char_boundary(&self.buf, 1);
        }
        self.buf.drain(..cut).collect()
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.buf
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Incremental UTF-8 decoder for PTY output.
///
/// Multi-byte sequences split across reads are carried to the next call.
/// Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates a decoder with no pending bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `bytes`, returning all complete text.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let input = std::mem::take(&mut self.pending);
        let mut out = String::with_capacity(input.len());
        let mut rest = &input[..];

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(n) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        None => {
                            self.pending.extend_from_slice(after);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes any incomplete trailing sequence as U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

struct BroadcastState {
    clients: HashMap<ClientId, ClientHandle>,
    scrollback: TextRing,
    poll: TextRing,
    closed: bool,
}

/// Broadcasts one session's PTY output to its subscribers.
#[derive(Clone)]
pub struct OutputBroadcaster {
    state: Arc<Mutex<BroadcastState>>,
    next_id: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl OutputBroadcaster {
    /// Creates a broadcaster with the given scrollback and poll buffer sizes.
    pub fn new(scrollback_bytes: usize, poll_buffer_bytes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BroadcastState {
                clients: HashMap::new(),
                scrollback: TextRing::new(scrollback_bytes),
                poll: TextRing::new(poll_buffer_bytes),
                closed: false,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber with a queue of `capacity` chunks.
    ///
    /// Returns the current scrollback together with the subscription. Both
    /// are taken under the same lock as [`publish`](Self::publish), so the
    /// first chunk received follows the scrollback exactly. Returns `None`
    /// once the broadcaster is closed.
    pub fn subscribe(&self, capacity: usize) -> Option<(String, OutputSubscription)> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        state.clients.insert(
            id,
            ClientHandle {
                id,
                tx,
                stats: ClientStats::default(),
                pending_drops: 0,
            },
        );
        let scrollback = state.scrollback.as_str().to_string();
        tracing::debug!(client_id = id, subscribers = state.clients.len(), "Added subscriber");

        Some((scrollback, OutputSubscription { id, rx }))
    }

    /// Removes a subscriber, returning its statistics.
    pub fn unsubscribe(&self, id: ClientId) -> Option<ClientStats> {
        self.lock().clients.remove(&id).map(|h| h.stats)
    }

    /// Fans a chunk of text out to every subscriber.
    ///
    /// Returns the number of subscribers that queued the chunk.
    pub fn publish(&self, text: String) -> usize {
        if text.is_empty() {
            return 0;
        }
        let mut state = self.lock();
        if state.closed {
            return 0;
        }
        state.scrollback.push(&text);
        state.poll.push(&text);

        let chunk = Bytes::from(text);
        let mut delivered = 0;
        state.clients.retain(|_, handle| {
            if handle.is_closed() {
                tracing::debug!(client_id = handle.id, "Removed disconnected subscriber");
                return false;
            }
            if handle.try_send(chunk.clone()) {
                delivered += 1;
            }
            true
        });
        delivered
    }

    /// Drains up to `max_bytes` of buffered output for poll-style readers.
    pub fn read_polled(&self, max_bytes: usize) -> String {
        self.lock().poll.take(max_bytes)
    }

    /// Ends the stream: subscribers drain what is queued, then see `None`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.clients.clear();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Returns the number of subscribers.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Returns whether the reader loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the PTY reader loop.
    ///
    /// Each read runs on the blocking pool; the loop ends at EOF, on a read
    /// error, or when the broadcaster is closed. The returned handle
    /// completes when the loop has ended.
    pub fn start_reader_loop<R>(&self, reader: R) -> JoinHandle<()>
    where
        R: Read + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Reader loop already running");
            return tokio::spawn(async {});
        }

        let broadcaster = self.clone();
        let reader = Arc::new(Mutex::new(reader));

        tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();

            loop {
                if !broadcaster.is_running() {
                    tracing::debug!("Reader loop stopping: not running");
                    break;
                }

                let reader = Arc::clone(&reader);
                let result = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                    let mut reader = reader.lock().unwrap_or_else(PoisonError::into_inner);
                    match reader.read(&mut buffer) {
                        Ok(0) => Ok(None),
                        Ok(n) => {
                            buffer.truncate(n);
                            Ok(Some(buffer))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await;

                match result {
                    Ok(Ok(Some(data))) => {
                        broadcaster.publish(decoder.decode(&data));
                    }
                    Ok(Ok(None)) => {
                        tracing::debug!("PTY EOF - reader loop ending");
                        break;
                    }
                    Ok(Err(e)) => {
                        // EIO is how Linux reports a hung-up PTY.
                        if broadcaster.is_running() && e.raw_os_error() != Some(5) {
                            tracing::warn!(error = %e, "Error reading from PTY");
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Read task panicked");
                        break;
                    }
                }
            }

            broadcaster.publish(decoder.finish());
            broadcaster.running.store(false, Ordering::SeqCst);
            tracing::debug!("Reader loop ended");
        })
    }
}
