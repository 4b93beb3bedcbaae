//! Client-side subscription coordinator.
//!
//! The receive loop is the sole owner of the broadcast connection's read
//! half and of the topic filter. The command loop talks to it only through
//! [`ReceiverControl`]: a queue of pending subscriptions and a stop flag.

use std::{
    collections::HashSet,
    io, mem,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::debug;

use crate::protocol::Frame;

/// Upper bound on any one wait inside the receive loop, so stop requests
/// and new subscriptions are picked up at least this often even when a
/// frame stalls mid-line.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The command loop's handle on the receive loop. Both operations are
/// non-blocking; neither waits for the loop to act on them.
#[derive(Debug, Default)]
pub struct ReceiverControl {
    pending: Mutex<Vec<String>>,
    stopped: AtomicBool,
}

impl ReceiverControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a topic for the receive loop to apply on its next cycle.
    pub fn request_subscribe(&self, topic: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.push(topic.to_string());
    }

    /// Idempotent. The caller must separately await the receive task to
    /// observe termination.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Swaps the whole queue out in one motion, so enqueues racing with a
    /// drain land either fully in this batch or fully in the next.
    fn drain_pending(&self) -> Vec<String> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        mem::take(&mut *pending)
    }
}

/// Topic filters with prefix semantics: a filter `room` matches `room` and
/// `room2`. An empty filter set matches nothing.
#[derive(Debug, Default)]
struct TopicFilter {
    prefixes: HashSet<String>,
}

impl TopicFilter {
    /// The empty topic would match everything, so requesting it is a no-op.
    fn insert(&mut self, topic: String) {
        if !topic.is_empty() {
            self.prefixes.insert(topic);
        }
    }

    fn matches(&self, topic: &str) -> bool {
        self.prefixes.iter().any(|prefix| topic.starts_with(prefix))
    }
}

/// Runs the receive loop until stop is requested or the broadcast
/// connection closes. Rendered lines go to `output` one per broadcast unit
/// that passes the filter. No single wait exceeds [`POLL_INTERVAL`], so
/// stop requests and queued subscriptions are honored even while a frame
/// is stalled mid-line.
pub async fn run<R, W>(control: Arc<ReceiverControl>, mut reader: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut filter = TopicFilter::default();
    let mut partial = Vec::new();
    let mut awaiting_body = None;

    while !control.stop_requested() {
        apply_pending(&control, &mut filter);

        let line = match poll_line(&mut reader, &mut partial).await? {
            LinePoll::Line(line) => line,
            LinePoll::Pending => continue,
            LinePoll::Eof => {
                debug!("broadcast connection closed by peer");
                break;
            }
        };

        if let Some(rendered) = assemble(&mut awaiting_body, &line, &filter) {
            // One write per line; renders interleave with other writers to
            // the same handle at line granularity only.
            output.write_all(format!("{rendered}\n").as_bytes()).await?;
            output.flush().await?;
        }
    }

    // Final drain, so topics queued just before stop are not silently lost.
    apply_pending(&control, &mut filter);
    Ok(())
}

fn apply_pending(control: &ReceiverControl, filter: &mut TopicFilter) {
    for topic in control.drain_pending() {
        filter.insert(topic);
    }
}

/// Outcome of one bounded poll for the next frame line.
enum LinePoll {
    Line(String),
    Pending,
    Eof,
}

/// Bounded wait for the next frame line. `read_until` appends whatever it
/// read to `partial` even when the timeout cancels it, so a line split
/// across waits is picked up where it left off and no bytes are lost.
async fn poll_line<R>(reader: &mut R, partial: &mut Vec<u8>) -> Result<LinePoll>
where
    R: AsyncBufRead + Unpin,
{
    match timeout(POLL_INTERVAL, reader.read_until(b'\n', partial)).await {
        Err(_) => return Ok(LinePoll::Pending),
        Ok(result) => {
            result?;
        }
    }

    // read_until only returns without a delimiter at end of stream; an
    // unterminated tail still forms the last line.
    if partial.is_empty() {
        return Ok(LinePoll::Eof);
    }
    if partial.last() == Some(&b'\n') {
        partial.pop();
    }
    while partial.last() == Some(&b'\r') {
        partial.pop();
    }

    let line = String::from_utf8(mem::take(partial)).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "frame line is not valid utf-8")
    })?;
    Ok(LinePoll::Line(line))
}

/// Feeds one frame line into the unit assembler, rendering completed units
/// that pass the filter.
///
/// A topic frame stores its payload and renders nothing; whatever line
/// follows it is the unit body, rendered as `[topic] body`. A lone final
/// frame renders unannotated, filtered on its own payload. Units failing
/// the filter are still consumed whole, so frame pairing stays aligned.
fn assemble(
    awaiting_body: &mut Option<String>,
    line: &str,
    filter: &TopicFilter,
) -> Option<String> {
    if let Some(topic) = awaiting_body.take() {
        let body = Frame::decode(line).payload;
        if filter.matches(&topic) {
            return Some(format!("[{topic}] {body}"));
        }
        return None;
    }

    let frame = Frame::decode(line);
    if frame.more {
        *awaiting_body = Some(frame.payload);
        return None;
    }
    if filter.matches(&frame.payload) {
        return Some(frame.payload);
    }
    None
}
