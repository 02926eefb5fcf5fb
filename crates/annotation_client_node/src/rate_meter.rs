use futures::prelude::*;
use std::{
    sync::atomic::{AtomicUsize, Ordering::*},
    time::Duration,
};

/// Counts captured frames and received detection batches over a fixed
/// interval.
pub struct RateMeter {
    interval: Duration,
    frames: AtomicUsize,
    batches: AtomicUsize,
}

/// One interval's throughput in events per second.
#[derive(Debug, Clone, Copy)]
pub struct Rates {
    pub frames: f64,
    pub batches: f64,
}

impl RateMeter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            frames: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        }
    }

    pub fn new_secs() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn bump_frame(&self) {
        self.frames.fetch_add(1, SeqCst);
    }

    pub fn bump_batch(&self) {
        self.batches.fetch_add(1, SeqCst);
    }

    pub fn rate_stream(&self) -> impl Stream<Item = Rates> + '_ {
        let secs = self.interval.as_secs_f64();
        async_std::stream::interval(self.interval).map(move |()| Rates {
            frames: self.frames.swap(0, SeqCst) as f64 / secs,
            batches: self.batches.swap(0, SeqCst) as f64 / secs,
        })
    }
}
