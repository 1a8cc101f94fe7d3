use std::sync::atomic::{AtomicU64, Ordering};

/// Persistent object identifier. Unique within a database; `0` is reserved
/// for the root.
pub type Oid = u64;

pub const ROOT_OID: Oid = 0;

/// Commit timestamp / MVCC version number. Strictly increasing across
/// transactions committed by this process: two distinct transactions within
/// the same database must receive distinct timestamps.
pub type Timestamp = u64;

/// Issues timestamps derived from the wall clock with microsecond
/// resolution, bumping by one tick whenever the clock hasn't advanced since
/// the previous call so that two calls never produce the same value.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self { last: AtomicU64::new(0) }
    }

    /// Returns a timestamp strictly greater than every timestamp this clock
    /// has previously returned.
    pub fn tick(&self) -> Timestamp {
        let wall = chrono::Utc::now().timestamp_micros().max(0) as u64;
        loop {
            let prev = self.last.load(Ordering::SeqCst);
            let next = if wall > prev { wall } else { prev + 1 };
            if self
                .last
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Records an externally observed timestamp (e.g. read from the log on
    /// catch-up) so that subsequent `tick()` calls stay strictly after it.
    pub fn observe(&self, timestamp: Timestamp) {
        let mut prev = self.last.load(Ordering::SeqCst);
        while timestamp > prev {
            match self
                .last
                .compare_exchange(prev, timestamp, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}
