//! Output batching for remote terminal output.
//!
//! Remote shells produce output in bursts of tiny reads. Forwarding each
//! read as its own WebSocket frame wastes bandwidth on framing and JSON
//! overhead, while buffering without bound adds latency. The batcher sits
//! between the stream-copy tasks and the [`MessageSink`] and coalesces
//! chunks into `output` frames.
//!
//! # Flush rules
//!
//! - After each append, a pending size of [`OUTPUT_FLUSH_THRESHOLD`] or more
//!   flushes immediately.
//! - Otherwise the flush timer is (re)armed for [`OUTPUT_FLUSH_DELAY`]; when
//!   it fires the buffer is flushed.
//! - [`OutputBatcher::stop`] drains the queue and performs one final flush
//!   before the task exits.
//!
//! A flush never splits a UTF-8 sequence: an incomplete trailing sequence
//! stays pending and the timer is re-armed. If nothing completes it within
//! one more delay it is flushed lossily (U+FFFD), as is any tail left at the
//! final flush.
//!
//! # Backpressure
//!
//! Flushing waits for room in the [`MessageSink`]. While a flush waits the
//! task stops draining its queue, so a stalled socket eventually blocks
//! [`OutputBatcher::write`] and with it the remote read side.
//!
//! # Ownership
//!
//! The pending buffer lives inside the batcher task. Producers only hold the
//! queue sender, so any number of copy tasks can feed one batcher.

// Rust guideline compliant 2025-01

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::message::Message;
use super::transport::MessageSink;
use crate::constants::{OUTPUT_FLUSH_DELAY, OUTPUT_FLUSH_THRESHOLD, OUTPUT_QUEUE_CAPACITY};

/// Coalesces output chunks into latency- and size-bounded `output` frames.
pub struct OutputBatcher {
    /// Queue towards the batcher task.
    data_tx: mpsc::Sender<Vec<u8>>,
    /// Stop signal observed by the task and by blocked writers.
    stop: CancellationToken,
    /// Batcher task handle, taken by the first `stop()`.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for OutputBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBatcher")
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl OutputBatcher {
    /// Spawn the batcher task writing `output` frames to `sink`.
    pub fn start(sink: MessageSink) -> Self {
        let (data_tx, data_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let stop = CancellationToken::new();
        let task = tokio::spawn(Self::run(data_rx, stop.clone(), sink));

        Self {
            data_tx,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a chunk of output.
    ///
    /// Waits while the queue is full. Returns `false` without queueing if the
    /// batcher is (or becomes) stopped while waiting.
    pub async fn write(&self, chunk: &[u8]) -> bool {
        if chunk.is_empty() {
            return true;
        }
        if self.stop.is_cancelled() {
            return false;
        }

        tokio::select! {
            biased;
            () = self.stop.cancelled() => false,
            sent = self.data_tx.send(chunk.to_vec()) => sent.is_ok(),
        }
    }

    /// Stop the batcher and wait for its final flush.
    ///
    /// Safe to call more than once; only the first call waits for the task.
    /// No `output` frame is emitted after this returns.
    pub async fn stop(&self) {
        self.stop.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("[Batcher] Task ended abnormally: {e}");
            }
        }
    }

    /// Whether [`stop`](Self::stop) has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Batcher task: owns the pending buffer exclusively.
    async fn run(
        mut data_rx: mpsc::Receiver<Vec<u8>>,
        stop: CancellationToken,
        sink: MessageSink,
    ) {
        let mut pending: Vec<u8> = Vec::with_capacity(OUTPUT_FLUSH_THRESHOLD);
        let timer = tokio::time::sleep(OUTPUT_FLUSH_DELAY);
        tokio::pin!(timer);
        let mut timer_armed = false;
        // Set when the last flush kept an incomplete UTF-8 tail back.
        let mut tail_held = false;

        loop {
            tokio::select! {
                chunk = data_rx.recv() => {
                    let Some(chunk) = chunk else {
                        // Every producer is gone.
                        flush(&mut pending, &sink, true).await;
                        return;
                    };

                    pending.extend_from_slice(&chunk);
                    if pending.len() >= OUTPUT_FLUSH_THRESHOLD {
                        flush(&mut pending, &sink, false).await;
                        tail_held = !pending.is_empty();
                        timer_armed = tail_held;
                    } else {
                        tail_held = false;
                        timer_armed = true;
                    }
                    if timer_armed {
                        timer.as_mut().reset(Instant::now() + OUTPUT_FLUSH_DELAY);
                    }
                }

                () = &mut timer, if timer_armed => {
                    // A tail that already sat out one delay is not going to
                    // be completed.
                    flush(&mut pending, &sink, tail_held).await;
                    tail_held = !pending.is_empty();
                    timer_armed = tail_held;
                    if timer_armed {
                        timer.as_mut().reset(Instant::now() + OUTPUT_FLUSH_DELAY);
                    }
                }

                () = stop.cancelled() => {
                    // Chunks already accepted into the queue still belong
                    // to the final frame.
                    data_rx.close();
                    while let Ok(chunk) = data_rx.try_recv() {
                        pending.extend_from_slice(&chunk);
                    }
                    flush(&mut pending, &sink, true).await;
                    return;
                }
            }
        }
    }
}

/// Emit pending bytes as one `output` frame.
///
/// No-op on an empty buffer. Unless `lossy` is set, an incomplete trailing
/// UTF-8 sequence is kept for the next flush. Waits while the sink is full.
async fn flush(pending: &mut Vec<u8>, sink: &MessageSink, lossy: bool) {
    let cut = if lossy {
        pending.len()
    } else {
        complete_utf8_len(pending)
    };
    if cut == 0 {
        return;
    }

    let text = String::from_utf8_lossy(&pending[..cut]).into_owned();
    pending.drain(..cut);

    if !sink.send(Message::output(text)).await {
        log::debug!("[Batcher] Transport writer gone, dropping output frame");
    }
}

/// Length of `buf` without a trailing, still incomplete UTF-8 sequence.
fn complete_utf8_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for i in (len.saturating_sub(3)..len).rev() {
        let byte = buf[i];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if len - i < needed { i } else { len };
    }
    len
}
