/*!
This module provides `BufferedWriter` that connects a bounded `Channel` to an `AutoFlushBuffer`
with a pump thread, so producers get backpressure from the channel while the sink receives
batches.

# Example

```rust
use flowgate::config::{BufferConfig, ChannelConfig, WriterConfig};
use flowgate::writer::BufferedWriter;
use flowgate::BoxError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

let batches = Arc::new(Mutex::new(Vec::new()));

let config = WriterConfig {
    channel: ChannelConfig { capacity: 8, ..Default::default() },
    buffer: BufferConfig { limit: 4, interval: Duration::from_secs(60) },
};
let writer = BufferedWriter::new(&config, {
    let batches = Arc::clone(&batches);
    move |batch: Vec<u32>| -> Result<(), BoxError> {
        batches.lock().unwrap().push(batch);
        Ok(())
    }
})
.unwrap();

for i in 0..10 {
    writer.write(i).unwrap();
}

// Everything written before close is delivered
writer.close();
assert_eq!(
    *batches.lock().unwrap(),
    [vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
);
```
!*/

use crate::channel::{Channel, PushError, PushTimeoutError};
use crate::config::{ConfigError, WriterConfig};
use crate::flush_buffer::{AutoFlushBuffer, Flush, Sink};
use crate::sync::lock;
use log::{debug, warn};

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Producer-facing end of a channel → buffer → sink pipeline.
pub struct BufferedWriter<T: Send + 'static> {
    channel: Channel<T>,
    buffer: Arc<AutoFlushBuffer<T>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> fmt::Debug for BufferedWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferedWriter")
            .field("channel", &self.channel)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl<T: Send + 'static> BufferedWriter<T> {
    /// Creates writer delivering batches to `sink` and starts its pump thread.
    pub fn new(config: &WriterConfig, sink: impl Sink<T> + 'static) -> Result<BufferedWriter<T>, ConfigError> {
        config.validate()?;

        let channel = Channel::with_config(&config.channel)?;
        let buffer = Arc::new(AutoFlushBuffer::with_config(&config.buffer, sink)?);

        let pump = {
            let channel = channel.clone();
            let buffer = Arc::clone(&buffer);
            thread::Builder::new()
                .name("BufferedWriter pump".to_string())
                .spawn(move || {
                    for item in &channel {
                        buffer.add(item);
                    }
                    debug!("writer channel drained");
                })
                .expect("failed to start pump thread")
        };

        Ok(BufferedWriter {
            channel,
            buffer,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Writes item, blocking while the channel is full.
    ///
    /// Returns the item back in `Err(PushError)` after `close`.
    pub fn write(&self, item: T) -> Result<(), PushError<T>> {
        self.channel.push(item)
    }

    /// Like `write` but gives up after `timeout`.
    pub fn write_timeout(&self, item: T, timeout: Duration) -> Result<(), PushTimeoutError<T>> {
        self.channel.push_timeout(item, timeout)
    }

    /// Channel feeding the buffer; its error sideband is free for producers and consumers to use.
    pub fn channel(&self) -> &Channel<T> {
        &self.channel
    }

    pub fn buffer(&self) -> &AutoFlushBuffer<T> {
        &self.buffer
    }

    /// Stops accepting writes, moves every queued item into the buffer and flushes it.
    ///
    /// Returns outcome of the final flush. Concurrent callers wait for each other, so every
    /// caller returns only after all queued items reached the buffer and were flushed. Calling it
    /// again has no further effect.
    pub fn close(&self) -> Flush {
        self.channel.close();

        // Held until shutdown so a second closer can not flush ahead of the draining pump
        let mut pump = lock(&self.pump);
        if let Some(pump) = pump.take() {
            if pump.join().is_err() {
                warn!("writer pump thread panicked");
            }
        }

        self.buffer.shutdown()
    }
}

impl<T: Send + 'static> Drop for BufferedWriter<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    pub use super::*;
    use crate::config::{BufferConfig, ChannelConfig};
    use crate::BoxError;
    use assert_matches::assert_matches;

    type Batches<T> = Arc<Mutex<Vec<Vec<T>>>>;

    fn writer(capacity: usize, limit: usize) -> (Batches<u32>, BufferedWriter<u32>) {
        let batches: Batches<u32> = Default::default();
        let config = WriterConfig {
            channel: ChannelConfig {
                capacity,
                ..Default::default()
            },
            buffer: BufferConfig {
                limit,
                interval: Duration::from_secs(10),
            },
        };

        let writer = BufferedWriter::new(&config, {
            let batches = Arc::clone(&batches);
            move |batch: Vec<u32>| -> Result<(), BoxError> {
                batches.lock().unwrap().push(batch);
                Ok(())
            }
        })
        .unwrap();

        (batches, writer)
    }

    #[test]
    fn test_close_delivers_everything_in_order() {
        let (batches, writer) = writer(2, 3);

        for i in 0..10 {
            writer.write(i).unwrap();
        }
        assert_eq!(writer.close(), Flush::Delivered(1));

        assert_eq!(
            *batches.lock().unwrap(),
            [vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8], vec![9]]
        );
        assert_eq!(writer.close(), Flush::Empty);
    }

    #[test]
    fn test_concurrent_close_waits_for_drain() {
        let batches: Batches<u32> = Default::default();
        let config = WriterConfig {
            channel: ChannelConfig {
                capacity: 16,
                ..Default::default()
            },
            buffer: BufferConfig {
                limit: 1,
                interval: Duration::from_secs(10),
            },
        };
        let writer = Arc::new(
            BufferedWriter::new(&config, {
                let batches = Arc::clone(&batches);
                move |batch: Vec<u32>| -> Result<(), BoxError> {
                    thread::sleep(Duration::from_millis(20));
                    batches.lock().unwrap().push(batch);
                    Ok(())
                }
            })
            .unwrap(),
        );

        for i in 0..10 {
            writer.write(i).unwrap();
        }

        let closers = (0..2)
            .map(|_| {
                let writer = Arc::clone(&writer);
                let batches = Arc::clone(&batches);
                thread::spawn(move || {
                    writer.close();
                    batches.lock().unwrap().concat().len()
                })
            })
            .collect::<Vec<_>>();

        for closer in closers {
            assert_eq!(closer.join().unwrap(), 10);
        }
    }

    #[test]
    fn test_write_after_close() {
        let (_batches, writer) = writer(2, 3);

        writer.close();
        assert_matches!(writer.write(1), Err(PushError(1)));
        assert_matches!(
            writer.write_timeout(2, Duration::from_millis(10)),
            Err(PushTimeoutError::Closed(2))
        );
    }

    #[test]
    fn test_many_producers() {
        let (batches, writer) = writer(4, 7);
        let writer = Arc::new(writer);

        let producers = (0..4)
            .map(|p| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for i in 0..100 {
                        writer.write(p * 100 + i).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for producer in producers {
            producer.join().unwrap();
        }
        writer.close();

        let mut delivered = batches.lock().unwrap().concat();
        delivered.sort_unstable();
        assert_eq!(delivered, (0..400).collect::<Vec<_>>());
        assert_eq!(writer.buffer().stats().delivered_items, 400);
    }

    #[test]
    fn test_error_sideband_available() {
        let (_batches, writer) = writer(2, 3);

        writer.channel().report_error("connection reset");
        writer.close();

        assert_eq!(
            writer.channel().poll_error().unwrap().to_string(),
            "connection reset"
        );
    }

    #[test]
    fn test_invalid_config() {
        let config = WriterConfig {
            channel: ChannelConfig {
                capacity: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        assert_matches!(
            BufferedWriter::new(&config, |_batch: Vec<u32>| -> Result<(), BoxError> { Ok(()) }),
            Err(ConfigError::ZeroCapacity)
        );
    }
}
