//! Deferred reclamation for shared snapshots
//!
//! Chain snapshots and analysis results are published through `basedrop`
//! shared cells. When the last reference to a retired value is dropped on an
//! audio or caller thread, `basedrop` only enqueues it; the actual free happens
//! here, on a background thread owned by the session.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basedrop::{Collector, Handle};

/// How often queued values are freed.
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

/// Background collector thread.
pub(crate) struct Reclaimer {
    handle: Handle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Spawn the collector thread and wait for its handle.
    pub(crate) fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("audiorig-reclaim".to_string())
            .spawn(move || {
                // Collector is !Sync, so it lives and dies on this thread
                let mut collector = Collector::new();
                if tx.send(collector.handle()).is_err() {
                    return;
                }
                log::debug!("reclaimer thread started");

                while !stop_flag.load(Ordering::Acquire) {
                    collector.collect();
                    thread::park_timeout(COLLECT_INTERVAL);
                }
                collector.collect();
                log::debug!("reclaimer thread stopped");
            })?;

        let handle = rx
            .recv()
            .map_err(|_| io::Error::other("reclaimer thread exited during startup"))?;

        Ok(Reclaimer {
            handle,
            stop,
            thread: Some(thread),
        })
    }

    /// Handle for allocating values freed by this reclaimer.
    pub(crate) fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::error!("reclaimer thread panicked");
            }
        }
    }
}
