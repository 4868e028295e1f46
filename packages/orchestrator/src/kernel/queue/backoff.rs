//! Retry backoff with full jitter.

use std::time::Duration;

/// Defaults tuned for steward work: model calls fail in bursts, so spread
/// retries instead of thundering back.
pub const DEFAULT_BASE: Duration = Duration::from_secs(2);
pub const DEFAULT_CAP: Duration = Duration::from_secs(300);

/// `min(cap, base * 2^attempt) * rand(0.5..1.0)`.
///
/// `attempt` is the value already charged at claim time; the first retry of
/// a task claimed once therefore backs off around `base * 2`.
pub fn full_jitter(attempt: i32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.clamp(0, 20) as u32;
    let ceiling = base
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(cap);
    ceiling.mul_f64(0.5 + fastrand::f64() * 0.5)
}
