/*!
This module provides `AutoFlushBuffer` that accumulates items and hands them in batches to a
`Sink` once `limit` items are pending or every `interval`, whichever comes first.

Concurrent flush requests collapse into one delivery: the first caller takes the pending items
and delivers them while later callers wait for that delivery to complete. Delivery is best-effort
and at-most-once; a batch the sink fails on is logged and dropped.

# Example

```rust
use flowgate::flush_buffer::{AutoFlushBuffer, Flush};
use flowgate::BoxError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

let batches = Arc::new(Mutex::new(Vec::new()));

// Flush every 3 items or 100 ms since the previous periodic flush
let buffer = AutoFlushBuffer::new(3, Duration::from_millis(100), {
    let batches = Arc::clone(&batches);
    move |batch: Vec<u32>| -> Result<(), BoxError> {
        batches.lock().unwrap().push(batch);
        Ok(())
    }
});

// Batch flushed due to size limit
buffer.add(1);
buffer.add(2);
buffer.add(3);
assert_eq!(*batches.lock().unwrap(), [vec![1, 2, 3]]);

// Batch flushed by the periodic trigger
buffer.add(4);
std::thread::sleep(Duration::from_millis(300));
assert_eq!(*batches.lock().unwrap(), [vec![1, 2, 3], vec![4]]);

// Remaining items are flushed on shutdown
buffer.add(5);
assert_eq!(buffer.shutdown(), Flush::Delivered(1));
assert_eq!(batches.lock().unwrap().last().unwrap(), &vec![5]);
```
!*/

mod ticker;

use crate::config::{BufferConfig, ConfigError};
use crate::sync::{deadline_after, lock, wait, wait_until};
use crate::BoxError;
use log::{debug, error};
use ticker::Ticker;

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Downstream receiver of flushed batches.
///
/// Called from whichever thread triggered the flush, including the buffer's ticker thread.
/// A sink must not call back into the buffer that feeds it.
pub trait Sink<T>: Send + Sync {
    /// Delivers one batch. An `Err` is logged and the batch is dropped.
    fn deliver(&self, batch: Vec<T>) -> Result<(), BoxError>;
}

impl<T, F, E> Sink<T> for F
where
    F: Fn(Vec<T>) -> Result<(), E> + Send + Sync,
    E: Into<BoxError>,
{
    fn deliver(&self, batch: Vec<T>) -> Result<(), BoxError> {
        self(batch).map_err(Into::into)
    }
}

/// Outcome of a flush request from the point of view of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// This caller delivered a batch of given number of items.
    Delivered(usize),
    /// This caller handed a batch of given number of items to the sink which failed on it;
    /// the items were dropped.
    Failed(usize),
    /// Nothing was pending.
    Empty,
    /// Another caller was delivering; it has completed.
    Joined,
}

/// The error returned by `flush_timeout` and `flush_deadline` when another caller's delivery
/// did not complete in time.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct FlushTimeoutError;

impl fmt::Display for FlushTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "timed out waiting for in-flight flush to complete")
    }
}

impl Error for FlushTimeoutError {}

/// Usage statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of items waiting for next flush.
    pub pending: usize,
    /// Number of batches accepted by the sink.
    pub delivered_batches: u64,
    /// Number of items in batches accepted by the sink.
    pub delivered_items: u64,
    /// Number of batches the sink failed on.
    pub failed_batches: u64,
    /// Number of items dropped with failed batches.
    pub failed_items: u64,
}

struct State<T> {
    pending: Vec<T>,
    // A caller is delivering a batch taken from `pending`
    flushing: bool,
    // Incremented when a delivery completes
    round: u64,
    stats: Stats,
}

struct Shared<T> {
    limit: usize,
    state: Mutex<State<T>>,
    flushed: Condvar,
    sink: Box<dyn Sink<T>>,
}

impl<T> Shared<T> {
    fn flush(&self) -> Flush {
        // Never times out without deadline
        self.flush_until(None).unwrap_or(Flush::Joined)
    }

    fn flush_until(&self, deadline: Option<Instant>) -> Result<Flush, FlushTimeoutError> {
        let mut state = lock(&self.state);

        if state.flushing {
            let round = state.round;
            while state.round == round {
                state = match deadline {
                    None => wait(&self.flushed, state),
                    Some(deadline) => {
                        wait_until(&self.flushed, state, deadline).map_err(|_| FlushTimeoutError)?
                    }
                };
            }
            return Ok(Flush::Joined);
        }

        if state.pending.is_empty() {
            return Ok(Flush::Empty);
        }

        state.flushing = true;
        let batch = mem::replace(&mut state.pending, Vec::with_capacity(self.limit.min(1024)));
        drop(state);

        // Adds go on into the next batch while this one is delivered
        let items = batch.len();
        let delivered = deliver(&*self.sink, batch);

        let mut state = lock(&self.state);
        state.flushing = false;
        state.round += 1;
        if delivered {
            state.stats.delivered_batches += 1;
            state.stats.delivered_items += items as u64;
        } else {
            state.stats.failed_batches += 1;
            state.stats.failed_items += items as u64;
        }
        self.flushed.notify_all();

        Ok(if delivered {
            Flush::Delivered(items)
        } else {
            Flush::Failed(items)
        })
    }

    fn add(&self, item: T) {
        let full = {
            let mut state = lock(&self.state);
            state.pending.push(item);
            state.pending.len() >= self.limit
        };

        if full {
            // Items added during a joined delivery may still exceed the limit
            while self.flush() == Flush::Joined {
                if lock(&self.state).pending.len() < self.limit {
                    break;
                }
            }
        }
    }
}

fn deliver<T>(sink: &dyn Sink<T>, batch: Vec<T>) -> bool {
    let items = batch.len();

    match panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(batch))) {
        Ok(Ok(())) => {
            debug!("delivered batch of {} items", items);
            true
        }
        Ok(Err(err)) => {
            error!("sink failed on batch of {} items; dropping it: {}", items, err);
            false
        }
        Err(panic) => {
            error!(
                "sink panicked on batch of {} items; dropping it: {}",
                items,
                panic_message(&*panic)
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Batches items for a `Sink` with a size and a time trigger.
///
/// Owns a ticker thread flushing every `interval` until `shutdown` is called or the buffer is
/// dropped.
pub struct AutoFlushBuffer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    interval: Duration,
    ticker: Mutex<Option<Ticker>>,
}

impl<T: Send + 'static> fmt::Debug for AutoFlushBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AutoFlushBuffer")
            .field("limit", &self.shared.limit)
            .field("interval", &self.interval)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Send + 'static> AutoFlushBuffer<T> {
    /// Creates buffer flushing to `sink` once `limit` items are pending and every `interval`.
    ///
    /// Panics if `limit == 0` or `interval` is zero.
    pub fn new(limit: usize, interval: Duration, sink: impl Sink<T> + 'static) -> AutoFlushBuffer<T> {
        assert!(limit > 0, "AutoFlushBuffer::new bad limit");
        assert!(!interval.is_zero(), "AutoFlushBuffer::new bad interval");

        let shared = Arc::new(Shared {
            limit,
            state: Mutex::new(State {
                pending: Vec::with_capacity(limit.min(1024)),
                flushing: false,
                round: 0,
                stats: Stats::default(),
            }),
            flushed: Condvar::new(),
            sink: Box::new(sink),
        });

        let ticker = {
            let shared = Arc::clone(&shared);
            Ticker::spawn(interval, move || {
                shared.flush();
            })
        };

        AutoFlushBuffer {
            shared,
            interval,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    /// Creates buffer from validated `config`.
    pub fn with_config(
        config: &BufferConfig,
        sink: impl Sink<T> + 'static,
    ) -> Result<AutoFlushBuffer<T>, ConfigError> {
        config.validate()?;
        Ok(AutoFlushBuffer::new(config.limit, config.interval, sink))
    }

    /// Appends item; flushes if `limit` items are now pending.
    pub fn add(&self, item: T) {
        self.shared.add(item)
    }

    /// Delivers all pending items to the sink, or waits for a delivery already in flight to
    /// complete.
    ///
    /// Items added after an in-flight delivery took its batch are not delivered by this call.
    pub fn flush(&self) -> Flush {
        self.shared.flush()
    }

    /// Like `flush` but waits for an in-flight delivery of another caller at most `timeout`.
    ///
    /// A caller that delivers itself always waits for its sink call to return.
    pub fn flush_timeout(&self, timeout: Duration) -> Result<Flush, FlushTimeoutError> {
        self.shared.flush_until(deadline_after(timeout))
    }

    /// Like `flush` but waits for an in-flight delivery of another caller until `deadline`.
    pub fn flush_deadline(&self, deadline: Instant) -> Result<Flush, FlushTimeoutError> {
        self.shared.flush_until(Some(deadline))
    }

    /// Stops the periodic trigger and flushes pending items.
    ///
    /// Items added afterwards are only flushed by reaching `limit` or by explicit `flush`.
    pub fn shutdown(&self) -> Flush {
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.stop();
        }
        self.flush()
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> Stats {
        let state = lock(&self.shared.state);
        Stats {
            pending: state.pending.len(),
            ..state.stats
        }
    }
}

impl<T: Send + 'static> Drop for AutoFlushBuffer<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
