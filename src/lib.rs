/*!
Backpressure primitives for data-ingestion pipelines.

* [`channel::Channel`] - capacity-bounded FIFO handoff with close and an error sideband,
* [`flush_buffer::AutoFlushBuffer`] - batches items for a sink on size or time, collapsing
  concurrent flushes into one delivery,
* [`rate_limit::TokenBucket`] - fixed-window limiter admitting `threshold` operations per `period`,
* [`writer::BufferedWriter`] - channel, pump thread and buffer wired together.

The primitives are independent; a pipeline composes them as
producer → rate limiter → channel → consumer → auto-flush buffer → sink.

Every blocking operation waits indefinitely by default and has `_timeout` and `_deadline`
variants that give up.
!*/

pub mod channel;
pub mod config;
pub mod flush_buffer;
pub mod rate_limit;
pub mod writer;

mod sync;

pub use channel::Channel;
pub use config::ConfigError;
pub use flush_buffer::{AutoFlushBuffer, Flush, Sink};
pub use rate_limit::TokenBucket;
pub use writer::BufferedWriter;

/// Type-erased error as carried by the channel error sideband and returned by sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
