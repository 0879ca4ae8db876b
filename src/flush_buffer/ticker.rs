use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, warn};

use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Thread calling `on_tick` every `interval` until stopped.
///
/// Ticks missed while `on_tick` is still running are skipped, not queued.
#[derive(Debug)]
pub(crate) struct Ticker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub(crate) fn spawn(interval: Duration, mut on_tick: impl FnMut() + Send + 'static) -> Ticker {
        let (stop, stopped) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("AutoFlushBuffer ticker".to_string())
            .spawn(move || {
                let ticks = tick(interval);
                debug!("periodic flush started every {:?}", interval);

                loop {
                    select! {
                        recv(ticks) -> _ => on_tick(),
                        // Sender end dropped
                        recv(stopped) -> _ => break,
                    }
                }

                debug!("periodic flush stopped");
            })
            .expect("failed to start ticker thread");

        Ticker { stop, handle }
    }

    /// Stops the thread and waits for a tick in progress to finish.
    pub(crate) fn stop(self) {
        let Ticker { stop, handle } = self;
        drop(stop);

        // Stopped from within `on_tick`; the loop ends once it returns
        if handle.thread().id() == thread::current().id() {
            return;
        }

        if handle.join().is_err() {
            warn!("ticker thread panicked");
        }
    }
}
