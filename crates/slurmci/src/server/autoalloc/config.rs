use std::time::Duration;

/// Maximum number of attempts of a single allocation before it is abandoned.
pub const DEFAULT_MAX_ALLOCATION_ATTEMPTS: u32 = 3;

/// Delays between successive allocation attempts of the same job.
/// The last delay is reused if there are more attempts than delays.
pub const ALLOCATION_RETRY_DELAYS: [Duration; 2] =
    [Duration::from_secs(5), Duration::from_secs(30)];

/// Every N discovery ticks, the cached ETag of each repository is dropped, so that jobs whose
/// allocation was abandoned are discovered again even if the listing did not change.
pub const ETAG_RESET_TICKS: u64 = 15;

/// Every N discovery ticks, currently allocated jobs are printed to the log.
pub const ALLOCATION_DUMP_TICKS: u64 = 15;

/// Delay between issuing the registration and the removal credential of a runner.
pub fn get_credential_delay() -> Duration {
    get_duration_from_env("SLURMCI_CREDENTIAL_DELAY_MS").unwrap_or_else(|| Duration::from_secs(1))
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Delay before the given (1-based) attempt. The first attempt is not delayed.
pub fn retry_delay(attempt: u32, delays: &[Duration]) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let index = (attempt as usize - 2).min(delays.len().saturating_sub(1));
    delays.get(index).copied().unwrap_or(Duration::ZERO)
}
