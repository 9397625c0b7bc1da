use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub(crate) fn new_id() -> Uuid {
    Uuid::new_v4()
}

pub(crate) fn new_id_as_string() -> String {
    format!("{}", new_id())
}

pub(crate) fn now_as_duration() -> Duration {
    // a clock set before 1970 reads as the epoch
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

pub(crate) fn epoch_as_millis() -> u128 {
    now_as_duration().as_millis()
}

/// Locks a std mutex, recovering the guard if a panicking
/// holder poisoned it. Every value guarded in this crate is
/// replaced wholesale under the lock, so it is never torn.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
