/*!
This module provides `Channel`, a capacity-bounded FIFO handoff between producer and consumer
threads with an explicit close and a sideband for out-of-band errors.

`push` blocks while the channel is full and `poll` blocks while it is empty. After `close` all
items already queued can still be polled; once they are drained `poll` returns `None`.

# Example

```rust
use flowgate::channel::Channel;
use std::thread;

let channel = Channel::new(2);

let producer = {
    let channel = channel.clone();
    thread::spawn(move || {
        for i in 1..=5 {
            // Blocks while two items are waiting to be polled
            channel.push(i).unwrap();
        }
        // Errors travel next to the data, not through it
        channel.report_error("upstream hiccup");
        channel.close();
    })
};

// Iteration ends once the channel is closed and drained
assert_eq!(channel.iter().collect::<Vec<_>>(), [1, 2, 3, 4, 5]);
producer.join().unwrap();

assert!(channel.has_error());
assert_eq!(channel.poll_error().unwrap().to_string(), "upstream hiccup");
assert!(!channel.has_error());
```
!*/

mod sideband;

use crate::config::{ChannelConfig, ConfigError};
use crate::sync::{deadline_after, lock, wait, wait_until};
use crate::BoxError;
use log::debug;
use sideband::Sideband;

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The error returned by `push` when the channel was closed; carries the rejected item.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct PushError<T>(pub T);

impl<T> PushError<T> {
    /// Returns the item that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("PushError(..)")
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pushing into a closed channel")
    }
}

impl<T> Error for PushError<T> {}

/// The error returned by `try_push`.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum TryPushError<T> {
    /// The channel is at capacity.
    Full(T),
    /// The channel was closed.
    Closed(T),
}

impl<T> TryPushError<T> {
    /// Returns the item that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(item) | TryPushError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TryPushError::Full(_) => f.write_str("Full(..)"),
            TryPushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TryPushError::Full(_) => write!(f, "pushing into a full channel"),
            TryPushError::Closed(_) => write!(f, "pushing into a closed channel"),
        }
    }
}

impl<T> Error for TryPushError<T> {}

/// The error returned by `push_timeout` and `push_deadline`.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum PushTimeoutError<T> {
    /// The channel stayed full until the deadline.
    Timeout(T),
    /// The channel was closed.
    Closed(T),
}

impl<T> PushTimeoutError<T> {
    /// Returns the item that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            PushTimeoutError::Timeout(item) | PushTimeoutError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for PushTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PushTimeoutError::Timeout(_) => f.write_str("Timeout(..)"),
            PushTimeoutError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for PushTimeoutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PushTimeoutError::Timeout(_) => write!(f, "timed out waiting for room in the channel"),
            PushTimeoutError::Closed(_) => write!(f, "pushing into a closed channel"),
        }
    }
}

impl<T> Error for PushTimeoutError<T> {}

/// The error returned by `try_poll`.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TryPollError {
    /// No item is queued right now.
    Empty,
    /// The channel was closed and all items were drained.
    Closed,
}

impl fmt::Display for TryPollError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TryPollError::Empty => write!(f, "polling an empty channel"),
            TryPollError::Closed => write!(f, "polling a closed and drained channel"),
        }
    }
}

impl Error for TryPollError {}

/// The error returned by `poll_timeout` and `poll_deadline`.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum PollTimeoutError {
    /// The channel stayed empty until the deadline.
    Timeout,
    /// The channel was closed and all items were drained.
    Closed,
}

impl fmt::Display for PollTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PollTimeoutError::Timeout => write!(f, "timed out waiting for an item"),
            PollTimeoutError::Closed => write!(f, "polling a closed and drained channel"),
        }
    }
}

impl Error for PollTimeoutError {}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    errors: Sideband,
    // Only ever goes from false to true
    closed: bool,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

/// Bounded FIFO channel with close and an error sideband.
///
/// This is a handle; clones refer to the same channel and may be used from any number of
/// producer and consumer threads.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Channel")
            .field("len", &state.queue.len())
            .field("capacity", &self.shared.capacity)
            .field("errors", &state.errors.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Channel<T> {
    /// Creates channel that holds up to `capacity` items before `push` blocks.
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Channel<T> {
        assert!(capacity > 0, "Channel::new bad capacity");

        Self::build(&ChannelConfig {
            capacity,
            ..Default::default()
        })
    }

    /// Creates channel from validated `config`.
    pub fn with_config(config: &ChannelConfig) -> Result<Channel<T>, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: &ChannelConfig) -> Channel<T> {
        Channel {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::with_capacity(config.capacity.min(1024)),
                    errors: Sideband::new(config.error_capacity),
                    closed: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                capacity: config.capacity,
            }),
        }
    }

    /// Appends item to the channel, blocking while it is full.
    ///
    /// Returns the item back in `Err(PushError)` if the channel was closed before or while
    /// waiting for room.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        self.push_until(item, None).map_err(|err| PushError(err.into_inner()))
    }

    /// Like `push` but gives up after `timeout`.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushTimeoutError<T>> {
        self.push_until(item, deadline_after(timeout))
    }

    /// Like `push` but gives up at `deadline`.
    pub fn push_deadline(&self, item: T, deadline: Instant) -> Result<(), PushTimeoutError<T>> {
        self.push_until(item, Some(deadline))
    }

    /// Appends item if there is room right now.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        let mut state = lock(&self.shared.state);
        if state.closed {
            return Err(TryPushError::Closed(item));
        }
        if state.queue.len() >= self.shared.capacity {
            return Err(TryPushError::Full(item));
        }
        state.queue.push_back(item);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    fn push_until(&self, item: T, deadline: Option<Instant>) -> Result<(), PushTimeoutError<T>> {
        let mut state = lock(&self.shared.state);

        // Predicate is checked before the deadline so a waiter woken late still takes the slot
        loop {
            if state.closed {
                return Err(PushTimeoutError::Closed(item));
            }
            if state.queue.len() < self.shared.capacity {
                break;
            }

            state = match deadline {
                None => wait(&self.shared.not_full, state),
                Some(deadline) => match wait_until(&self.shared.not_full, state, deadline) {
                    Ok(state) => state,
                    Err(_state) => return Err(PushTimeoutError::Timeout(item)),
                },
            };
        }

        state.queue.push_back(item);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Removes and returns the oldest item, blocking while the channel is empty.
    ///
    /// Returns `None` only once the channel is closed and no items are left.
    pub fn poll(&self) -> Option<T> {
        self.poll_until(None).ok()
    }

    /// Like `poll` but gives up after `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<T, PollTimeoutError> {
        self.poll_until(deadline_after(timeout))
    }

    /// Like `poll` but gives up at `deadline`.
    pub fn poll_deadline(&self, deadline: Instant) -> Result<T, PollTimeoutError> {
        self.poll_until(Some(deadline))
    }

    /// Removes and returns the oldest item if there is one right now.
    pub fn try_poll(&self) -> Result<T, TryPollError> {
        let mut state = lock(&self.shared.state);
        match state.queue.pop_front() {
            Some(item) => {
                self.shared.not_full.notify_one();
                Ok(item)
            }
            None if state.closed => Err(TryPollError::Closed),
            None => Err(TryPollError::Empty),
        }
    }

    fn poll_until(&self, deadline: Option<Instant>) -> Result<T, PollTimeoutError> {
        let mut state = lock(&self.shared.state);

        loop {
            if let Some(item) = state.queue.pop_front() {
                self.shared.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(PollTimeoutError::Closed);
            }

            state = match deadline {
                None => wait(&self.shared.not_empty, state),
                Some(deadline) => match wait_until(&self.shared.not_empty, state, deadline) {
                    Ok(state) => state,
                    Err(_state) => return Err(PollTimeoutError::Timeout),
                },
            };
        }
    }

    /// Closes the channel.
    ///
    /// Queued items stay available to `poll`. Blocked consumers wake up to drain them or observe
    /// the close, and blocked producers wake up with their item handed back. Calling it again
    /// has no effect.
    pub fn close(&self) {
        let mut state = lock(&self.shared.state);
        if state.closed {
            return;
        }
        state.closed = true;
        debug!("channel closed with {} items left to drain", state.queue.len());

        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    /// Checks if `close` was called.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Records an error in the sideband. Never blocks and never affects `push` or `poll`.
    pub fn report_error(&self, error: impl Into<BoxError>) {
        lock(&self.shared.state).errors.push(error.into());
    }

    /// Checks if there is an unread error in the sideband.
    pub fn has_error(&self) -> bool {
        lock(&self.shared.state).errors.len() > 0
    }

    /// Removes and returns the oldest unread error.
    pub fn poll_error(&self) -> Option<BoxError> {
        lock(&self.shared.state).errors.pop()
    }

    /// Number of unread errors.
    pub fn error_count(&self) -> usize {
        lock(&self.shared.state).errors.len()
    }

    /// Number of errors discarded because the sideband was full.
    pub fn dropped_errors(&self) -> u64 {
        lock(&self.shared.state).errors.dropped()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.shared.capacity
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Returns blocking iterator over polled items that ends once the channel is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter(self)
    }
}

/// Blocking iterator returned by `Channel::iter()`.
#[derive(Debug)]
pub struct Iter<'c, T>(&'c Channel<T>);

impl<'c, T> Iterator for Iter<'c, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.0.poll()
    }
}

impl<'c, T> IntoIterator for &'c Channel<T> {
    type Item = T;
    type IntoIter = Iter<'c, T>;

    fn into_iter(self) -> Iter<'c, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    pub use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_push_blocks_at_capacity() {
        let channel = Channel::new(2);

        channel.push('A').unwrap();
        channel.push('B').unwrap();
        assert!(channel.is_full());

        let pushed = Arc::new(AtomicBool::new(false));
        let producer = {
            let channel = channel.clone();
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                channel.push('C').unwrap();
                pushed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(200));
        assert!(!pushed.load(Ordering::SeqCst)); // still blocked on full channel

        assert_eq!(channel.poll(), Some('A'));
        producer.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));

        assert_eq!(channel.poll(), Some('B'));
        assert_eq!(channel.poll(), Some('C'));
    }

    #[test]
    fn test_fifo_across_threads() {
        let channel = Channel::new(4);

        let producer = {
            let channel = channel.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    channel.push(i).unwrap();
                }
                channel.close();
            })
        };

        let received = channel.iter().collect::<Vec<_>>();
        producer.join().unwrap();

        assert_eq!(received, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_keeps_queued_items() {
        let channel = Channel::new(4);

        channel.push(1).unwrap();
        channel.push(2).unwrap();
        channel.close();
        channel.close(); // no-op

        assert!(channel.is_closed());
        assert_eq!(channel.poll(), Some(1));
        assert_eq!(channel.poll(), Some(2));
        assert_eq!(channel.poll(), None);
        assert_eq!(channel.poll(), None);
    }

    #[test]
    fn test_close_wakes_consumer() {
        let channel = Channel::<u32>::new(1);

        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || channel.poll())
        };

        thread::sleep(Duration::from_millis(100));
        channel.close();

        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_push_after_close() {
        let channel = Channel::new(1);
        channel.close();

        assert_matches!(channel.push(3), Err(PushError(3)));
        assert_matches!(channel.try_push(3), Err(TryPushError::Closed(3)));
        assert!(channel.is_empty());
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let channel = Channel::new(1);
        channel.push(1).unwrap();

        let producer = {
            let channel = channel.clone();
            thread::spawn(move || channel.push(2))
        };

        thread::sleep(Duration::from_millis(100));
        channel.close();

        assert_matches!(producer.join().unwrap(), Err(PushError(2)));
        assert_eq!(channel.poll(), Some(1));
        assert_eq!(channel.poll(), None);
    }

    #[test]
    fn test_timeouts() {
        let channel = Channel::new(1);

        assert_matches!(
            channel.poll_timeout(Duration::from_millis(50)),
            Err(PollTimeoutError::Timeout)
        );

        channel.push(1).unwrap();
        assert_matches!(
            channel.push_timeout(2, Duration::from_millis(50)),
            Err(PushTimeoutError::Timeout(2))
        );
        assert_matches!(
            channel.push_deadline(2, Instant::now()),
            Err(PushTimeoutError::Timeout(2))
        );

        assert_matches!(channel.poll_timeout(Duration::from_millis(50)), Ok(1));
        assert_matches!(channel.push_timeout(2, Duration::from_millis(50)), Ok(()));

        channel.close();
        assert_matches!(channel.poll_deadline(Instant::now()), Ok(2));
        assert_matches!(
            channel.poll_timeout(Duration::from_millis(50)),
            Err(PollTimeoutError::Closed)
        );
        assert_matches!(
            channel.push_timeout(3, Duration::from_millis(50)),
            Err(PushTimeoutError::Closed(3))
        );
    }

    #[test]
    fn test_timeouts_beyond_instant_range_wait_indefinitely() {
        let channel = Arc::new(Channel::new(1));

        assert_matches!(channel.push_timeout(1, Duration::MAX), Ok(()));
        assert_matches!(channel.poll_timeout(Duration::MAX), Ok(1));

        let consumer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.poll_timeout(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert_matches!(consumer.join().unwrap(), Err(PollTimeoutError::Closed));
    }

    #[test]
    fn test_push_timeout_succeeds_when_room_appears() {
        let channel = Channel::new(1);
        channel.push(1).unwrap();

        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                channel.poll()
            })
        };

        assert_matches!(channel.push_timeout(2, Duration::from_secs(5)), Ok(()));
        assert_eq!(consumer.join().unwrap(), Some(1));
        assert_eq!(channel.poll(), Some(2));
    }

    #[test]
    fn test_try_variants() {
        let channel = Channel::new(1);

        assert_matches!(channel.try_poll(), Err(TryPollError::Empty));
        assert_matches!(channel.try_push(1), Ok(()));
        assert_matches!(channel.try_push(2), Err(TryPushError::Full(2)));
        assert_matches!(channel.try_poll(), Ok(1));

        channel.close();
        assert_matches!(channel.try_poll(), Err(TryPollError::Closed));
    }

    #[test]
    fn test_error_sideband() {
        let channel = Channel::new(1);

        assert!(!channel.has_error());
        assert!(channel.poll_error().is_none());

        channel.report_error("first");
        channel.report_error(std::io::Error::new(std::io::ErrorKind::Other, "second"));

        // Data path is not affected
        channel.push(1).unwrap();
        assert_eq!(channel.poll(), Some(1));

        // Errors outlive close
        channel.close();
        assert_eq!(channel.error_count(), 2);
        assert_eq!(channel.poll_error().unwrap().to_string(), "first");
        assert_eq!(channel.poll_error().unwrap().to_string(), "second");
        assert!(!channel.has_error());
    }

    #[test]
    fn test_error_sideband_bounded() {
        let channel = Channel::<u32>::with_config(&ChannelConfig {
            capacity: 1,
            error_capacity: 2,
        })
        .unwrap();

        channel.report_error("one");
        channel.report_error("two");
        channel.report_error("three");

        assert_eq!(channel.error_count(), 2);
        assert_eq!(channel.dropped_errors(), 1);
        assert_eq!(channel.poll_error().unwrap().to_string(), "two");
    }

    #[test]
    fn test_with_config_rejects_zero_capacity() {
        let config = ChannelConfig {
            capacity: 0,
            ..Default::default()
        };
        assert_matches!(Channel::<u32>::with_config(&config), Err(ConfigError::ZeroCapacity));
    }

    #[test]
    #[should_panic(expected = "Channel::new bad capacity")]
    fn test_zero_capacity_panics() {
        let _ = Channel::<u32>::new(0);
    }

    #[test]
    fn test_many_producers_and_consumers() {
        let channel = Channel::new(3);

        let producers = (0..4)
            .map(|p| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        channel.push(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        let consumers = (0..3)
            .map(|_| {
                let channel = channel.clone();
                thread::spawn(move || channel.iter().collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        for producer in producers {
            producer.join().unwrap();
        }
        channel.close();

        let mut received = consumers
            .into_iter()
            .flat_map(|consumer| consumer.join().unwrap())
            .collect::<Vec<_>>();
        received.sort_unstable();

        let mut expected = (0..4)
            .flat_map(|p| (0..250).map(move |i| p * 1000 + i))
            .collect::<Vec<_>>();
        expected.sort_unstable();

        assert_eq!(received, expected);
    }
}
