use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Next election deadline, freshly randomized so split votes resolve.
pub fn next_election_deadline(min_ms: u64, max_ms: u64) -> Instant {
    Instant::now() + random_election_timeout(min_ms, max_ms)
}
