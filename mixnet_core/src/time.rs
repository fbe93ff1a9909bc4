//! Functions to work with time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Return number of seconds that have elapsed since Unix epoch.
pub fn unix_time(time: SystemTime) -> u64 {
    let since_the_epoch = time
        .duration_since(UNIX_EPOCH)
        .expect("Current time is earlier than Unix epoch");
    since_the_epoch.as_secs()
}

/// Returns an `Instant` corresponding to "now". Mockable with
/// `tokio::time::pause` in tests.
pub fn clock_now() -> Instant {
    Instant::now()
}

/// Returns the amount of time elapsed since an `Instant`.
pub fn clock_elapsed(time: Instant) -> Duration {
    clock_now() - time
}
