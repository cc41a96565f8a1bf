//! In-process Pipe (spec §4.C): a typed, back-pressured, interval-aware
//! channel. A single `Pipe` value is a cheap handle (`Arc`-backed) onto
//! shared state; producer and consumer hold clones of the same handle
//! the way the reference's single `LocalPipe` object serves both ends
//! under cooperative scheduling. Ownership discipline (producer owns
//! writes, consumer owns the read buffer) is a calling convention, not
//! something the type enforces — exactly as in the reference.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::debug;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, Duration};

use crate::block::Block;
use crate::error::{JouleError, Result};
use crate::layout::Layout;

/// Poll interval used while waiting for data or buffer space, so the host
/// task can observe external cancellation (spec §5, "Suspension points").
const POLL_INTERVAL: Duration = Duration::from_millis(50);

type CloseCb = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug)]
enum QueueItem {
    Data(Block),
    Marker,
}

struct Cache {
    capacity: usize,
    pending: Block,
}

struct PipeState {
    read_buffer: Block,
    queue: VecDeque<QueueItem>,
    queued_rows: usize,
    closed: bool,
    last_timestamp: Option<u64>,
    subscribers: Vec<Pipe>,
    cache: Option<Cache>,
    buffer_size: Option<usize>,
    interval_break: bool,
    close_cb: Option<CloseCb>,
}

/// Structured vs. flattened read result, mirroring the reference's
/// `flatten` parameter on `read`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadData {
    Structured(Block),
    /// Rows as `[timestamp, v0, v1, ...]`, timestamps cast to f64.
    Flat(Vec<Vec<f64>>),
}

impl ReadData {
    pub fn len(&self) -> usize {
        match self {
            ReadData::Structured(b) => b.len(),
            ReadData::Flat(rows) => rows.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn flatten_block(block: &Block) -> Vec<Vec<f64>> {
    (0..block.len())
        .map(|i| {
            let mut row = vec![block.timestamps[i] as f64];
            row.extend(block.row_values(i).into_iter().map(|e| e.as_f64()));
            row
        })
        .collect()
}

/// Tags which concrete transport backs a `Pipe` handle. Subscribers must
/// be variant-compatible with the producer's write path: only an
/// in-process producer can accept `write_nowait` (spec §9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeVariant {
    Local,
    Framed,
}

/// A cloneable handle onto a pipe's shared state.
#[derive(Clone)]
pub struct Pipe {
    pub name: String,
    pub layout: Layout,
    pub variant: PipeVariant,
    inner: Arc<Mutex<PipeState>>,
    notify: Arc<Notify>,
}

impl Pipe {
    pub fn new(layout: Layout, name: impl Into<String>) -> Self {
        Pipe {
            name: name.into(),
            layout,
            variant: PipeVariant::Local,
            inner: Arc::new(Mutex::new(PipeState {
                read_buffer: Block::empty(layout),
                queue: VecDeque::new(),
                queued_rows: 0,
                closed: false,
                last_timestamp: None,
                subscribers: Vec::new(),
                cache: None,
                buffer_size: None,
                interval_break: false,
                close_cb: None,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A handle tagged as backed by a framed (cross-process) transport.
    pub fn new_framed(layout: Layout, name: impl Into<String>) -> Self {
        let mut pipe = Pipe::new(layout, name);
        pipe.variant = PipeVariant::Framed;
        pipe
    }

    pub fn with_buffer_size(layout: Layout, name: impl Into<String>, buffer_size: usize) -> Self {
        let pipe = Pipe::new(layout, name);
        {
            let inner = pipe.inner.clone();
            // synchronous, no contention possible yet
            if let Ok(mut state) = inner.try_lock() {
                state.buffer_size = Some(buffer_size);
            }
        }
        pipe
    }

    pub fn set_close_cb(&self, cb: CloseCb) {
        if let Ok(mut state) = self.inner.try_lock() {
            state.close_cb = Some(cb);
        }
    }

    pub async fn subscribe(&self, sink: Pipe) {
        let mut state = self.inner.lock().await;
        state.subscribers.push(sink);
    }

    pub async fn enable_cache(&self, lines: usize) {
        let mut state = self.inner.lock().await;
        state.cache = Some(Cache {
            capacity: lines,
            pending: Block::empty(self.layout),
        });
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queued_rows
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Write a structured block. Never blocks on a slow subscriber unless
    /// this pipe's own buffer bound is reached.
    pub async fn write(&self, block: Block) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        self.wait_for_capacity(block.len()).await?;
        let caching = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(JouleError::Pipe(format!("pipe [{}] is closed", self.name)));
            }
            block.validate_monotonic(state.last_timestamp)?;
            state.last_timestamp = block.last_timestamp().or(state.last_timestamp);
            state.cache.is_some()
        };

        if caching {
            let full = {
                let mut state = self.inner.lock().await;
                let cache = state.cache.as_mut().expect("checked above");
                cache.pending.append(block);
                cache.pending.len() >= cache.capacity
            };
            if full {
                self.flush_cache().await?;
            }
            return Ok(());
        }

        self.fan_out_and_enqueue(block, false).await
    }

    /// Fails instead of suspending when the buffer bound would be
    /// exceeded. Only an in-process producer may call this; a framed
    /// pipe's writer always has I/O in the critical path.
    pub async fn write_nowait(&self, block: Block) -> Result<()> {
        if self.variant == PipeVariant::Framed {
            return Err(JouleError::Pipe(format!(
                "cannot write_nowait to framed pipe [{}]",
                self.name
            )));
        }
        if block.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(JouleError::Pipe(format!("pipe [{}] is closed", self.name)));
            }
            if let Some(bound) = state.buffer_size {
                if state.read_buffer.len() + state.queued_rows + block.len() > bound {
                    return Err(JouleError::Pipe(format!(
                        "pipe [{}] buffer is full",
                        self.name
                    )));
                }
            }
            block.validate_monotonic(state.last_timestamp)?;
            state.last_timestamp = block.last_timestamp().or(state.last_timestamp);
        }
        self.fan_out_and_enqueue(block, true).await
    }

    /// Fan the block out to subscribers, then enqueue it locally and bump
    /// `queued_rows`, per spec §4.C's write ordering. The pipe's own lock
    /// is not held while awaiting a subscriber's write, so a slow
    /// subscriber's back-pressure can never deadlock against this pipe.
    async fn fan_out_and_enqueue(&self, block: Block, nowait: bool) -> Result<()> {
        let subscribers = {
            let state = self.inner.lock().await;
            state.subscribers.clone()
        };
        for sub in &subscribers {
            if nowait {
                Box::pin(sub.write_nowait(block.clone())).await?;
            } else {
                Box::pin(sub.write(block.clone())).await?;
            }
        }

        let mut state = self.inner.lock().await;
        let rows = block.len();
        debug!("[{}:write] queueing block with [{}] rows", self.name, rows);
        state.queue.push_back(QueueItem::Data(block));
        state.queued_rows += rows;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn wait_for_capacity(&self, incoming: usize) -> Result<()> {
        loop {
            {
                let state = self.inner.lock().await;
                let Some(bound) = state.buffer_size else {
                    return Ok(());
                };
                if state.read_buffer.len() + state.queued_rows + incoming <= bound {
                    return Ok(());
                }
                if state.closed {
                    return Err(JouleError::Pipe(format!("pipe [{}] is closed", self.name)));
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn flush_cache(&self) -> Result<()> {
        let pending = {
            let mut state = self.inner.lock().await;
            let Some(cache) = state.cache.as_mut() else {
                return Ok(());
            };
            if cache.pending.is_empty() {
                return Ok(());
            }
            std::mem::replace(&mut cache.pending, Block::empty(self.layout))
        };
        self.fan_out_and_enqueue(pending, false).await
    }

    /// Flush the cache (if any) and enqueue an interval marker.
    pub async fn close_interval(&self) -> Result<()> {
        self.flush_cache().await?;
        let mut state = self.inner.lock().await;
        state.queue.push_back(QueueItem::Marker);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Read newly queued data, or wait until at least one block (or
    /// marker) is available, or the pipe closes.
    pub async fn read(&self, flatten: bool) -> Result<ReadData> {
        loop {
            {
                let mut state = self.inner.lock().await;
                state.interval_break = false;
                if state.queue.is_empty() && !state.read_buffer.is_empty() {
                    return Ok(self.format(&state.read_buffer, flatten));
                }
                if state.queue.is_empty() && state.read_buffer.is_empty() && state.closed {
                    return Err(JouleError::EmptyPipe);
                }
                if !state.queue.is_empty() {
                    self.drain_queue(&mut state);
                    return Ok(self.format(&state.read_buffer, flatten));
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Non-suspending variant: returns whatever is immediately available.
    pub async fn read_nowait(&self, flatten: bool) -> Result<ReadData> {
        let mut state = self.inner.lock().await;
        state.interval_break = false;
        if state.queue.is_empty() && !state.read_buffer.is_empty() {
            return Ok(self.format(&state.read_buffer, flatten));
        }
        if state.queue.is_empty() && state.read_buffer.is_empty() && state.closed {
            return Err(JouleError::EmptyPipe);
        }
        self.drain_queue(&mut state);
        Ok(self.format(&state.read_buffer, flatten))
    }

    /// Append every currently queued block to the read buffer up to the
    /// first interval marker (exclusive). If the first queue element is a
    /// marker, sets `end_of_interval` and leaves the buffer untouched.
    fn drain_queue(&self, state: &mut PipeState) {
        if matches!(state.queue.front(), Some(QueueItem::Marker)) {
            state.queue.pop_front();
            state.interval_break = true;
            return;
        }
        while let Some(item) = state.queue.front() {
            match item {
                QueueItem::Marker => {
                    state.queue.pop_front();
                    state.interval_break = true;
                    break;
                }
                QueueItem::Data(_) => {
                    let Some(QueueItem::Data(block)) = state.queue.pop_front() else {
                        unreachable!()
                    };
                    state.queued_rows -= block.len();
                    state.read_buffer.append(block);
                }
            }
        }
    }

    fn format(&self, buffer: &Block, flatten: bool) -> ReadData {
        if flatten {
            ReadData::Flat(flatten_block(buffer))
        } else {
            ReadData::Structured(buffer.clone())
        }
    }

    /// True if the most recent `read` stopped at an interval marker.
    pub async fn end_of_interval(&self) -> bool {
        self.inner.lock().await.interval_break
    }

    /// Trim `num_rows` from the front of the read buffer.
    pub async fn consume(&self, num_rows: usize) -> Result<()> {
        if num_rows == 0 {
            return Ok(());
        }
        let mut state = self.inner.lock().await;
        if num_rows > state.read_buffer.len() {
            return Err(JouleError::Pipe(format!(
                "cannot consume {} rows: only {} available",
                num_rows,
                state.read_buffer.len()
            )));
        }
        let remaining = state.read_buffer.split_off(num_rows);
        state.read_buffer = remaining;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Close the pipe, run `close_cb` if registered, and transitively
    /// close every subscriber.
    pub async fn close(&self) -> Result<()> {
        let (cb, subscribers) = {
            let mut state = self.inner.lock().await;
            state.closed = true;
            (state.close_cb.clone(), state.subscribers.clone())
        };
        self.notify.notify_waiters();
        if let Some(cb) = cb {
            cb().await;
        }
        for sub in subscribers {
            Box::pin(sub.close()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    fn layout() -> Layout {
        Layout::parse("int32_1").unwrap()
    }

    fn block(rows: &[(u64, f64)]) -> Block {
        Block::from_flat_values(
            layout(),
            &rows
                .iter()
                .map(|(t, v)| vec![*t as f64, *v])
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn s1_round_trip_and_consume() {
        let pipe = Pipe::new(layout(), "p");
        pipe.write(block(&[(10, 1.0), (20, 2.0), (30, 3.0)]))
            .await
            .unwrap();
        let data = pipe.read(false).await.unwrap();
        assert_eq!(data.len(), 3);
        pipe.consume(2).await.unwrap();
        let data = pipe.read(false).await.unwrap();
        assert_eq!(data.len(), 1);
        if let ReadData::Structured(b) = data {
            assert_eq!(b.timestamps, vec![30]);
        } else {
            panic!("expected structured data");
        }
    }

    #[tokio::test]
    async fn s2_interval_marker() {
        let pipe = Pipe::new(layout(), "p");
        pipe.write(block(&[(10, 1.0)])).await.unwrap();
        pipe.close_interval().await.unwrap();
        pipe.write(block(&[(20, 2.0)])).await.unwrap();

        let data = pipe.read(false).await.unwrap();
        assert_eq!(data.len(), 1);
        assert!(pipe.end_of_interval().await);
        pipe.consume(1).await.unwrap();

        let data = pipe.read(false).await.unwrap();
        assert_eq!(data.len(), 1);
        assert!(!pipe.end_of_interval().await);
    }

    #[tokio::test]
    async fn s3_non_monotonic_rejected() {
        let pipe = Pipe::new(layout(), "p");
        let result = pipe.write(block(&[(10, 1.0), (5, 2.0)])).await;
        assert!(result.is_err());
        // buffer unchanged: nothing was queued
        assert_eq!(pipe.queue_len().await, 0);
    }

    #[tokio::test]
    async fn read_on_closed_empty_pipe_is_empty_pipe_error() {
        let pipe = Pipe::new(layout(), "p");
        pipe.close().await.unwrap();
        let err = pipe.read(false).await.unwrap_err();
        assert!(matches!(err, JouleError::EmptyPipe));
    }

    #[tokio::test]
    async fn consume_errors_are_pipe_errors() {
        let pipe = Pipe::new(layout(), "p");
        pipe.write_nowait(block(&[(10, 1.0)])).await.unwrap();
        let _ = pipe.read_nowait(false).await.unwrap();
        assert!(pipe.consume(2).await.is_err());
    }

    #[tokio::test]
    async fn subscribers_receive_fanned_out_writes() {
        let producer = Pipe::new(layout(), "producer");
        let subscriber = Pipe::new(layout(), "subscriber");
        producer.subscribe(subscriber.clone()).await;
        producer
            .write(block(&[(10, 1.0), (20, 2.0)]))
            .await
            .unwrap();
        let data = subscriber.read(false).await.unwrap();
        assert_eq!(data.len(), 2);
    }

    #[tokio::test]
    async fn cache_batches_writes_until_full() {
        let pipe = Pipe::new(layout(), "p");
        pipe.enable_cache(2).await;
        pipe.write(block(&[(10, 1.0)])).await.unwrap();
        assert_eq!(pipe.queue_len().await, 0); // not flushed yet
        pipe.write(block(&[(20, 2.0)])).await.unwrap();
        assert_eq!(pipe.queue_len().await, 2); // flushed once full
    }

    #[tokio::test]
    async fn close_propagates_to_subscribers() {
        let producer = Pipe::new(layout(), "producer");
        let subscriber = Pipe::new(layout(), "subscriber");
        producer.subscribe(subscriber.clone()).await;
        producer.close().await.unwrap();
        assert!(subscriber.is_closed().await);
    }
}
