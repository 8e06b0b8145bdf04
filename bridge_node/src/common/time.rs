use chrono::Utc;

/// Unix time of the storage network's genesis block, in seconds.
const NETWORK_GENESIS_SECS: i64 = 1_598_306_400;

/// Seconds per storage network epoch.
const EPOCH_DURATION_SECS: i64 = 30;

pub const EPOCHS_PER_HOUR: i64 = 3600 / EPOCH_DURATION_SECS;

/// Current wall clock in UTC milliseconds, the unit every record timestamp uses.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current storage network epoch derived from the wall clock.
pub fn current_epoch() -> i64 {
    (Utc::now().timestamp() - NETWORK_GENESIS_SECS) / EPOCH_DURATION_SECS
}
