use std::time::Duration;

use rand::Rng;

/// Exponential backoff with half jitter: the delay for attempt `n` is drawn
/// from `[cap / 2, cap]` where `cap = min * 2^n`, bounded by `max`.
pub(crate) fn compute_backoff(attempts: u32, min: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempts.min(16));
    let cap = min.saturating_mul(factor).min(max);
    let half = cap / 2;
    half + rand::rng().random_range(Duration::ZERO..=half)
}
