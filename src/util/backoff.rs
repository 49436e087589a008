use rand::Rng;

/// Delay before the first retry.
pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
/// Jitter as a fraction of the current base delay, applied in both directions.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

/// Base delay with a random offset of up to `jitter * base` either way.
pub fn jittered_delay_millis(base_millis: f64, jitter: f64) -> u64 {
    jittered_delay_with_rng(base_millis, jitter, &mut rand::thread_rng())
}

pub fn jittered_delay_with_rng<R: Rng + ?Sized>(base_millis: f64, jitter: f64, rng: &mut R) -> u64 {
    if base_millis <= 0.0 {
        return 0;
    }
    let offset = if jitter > 0.0 {
        jitter * base_millis * rng.gen_range(-1.0..=1.0)
    } else {
        0.0
    };
    (base_millis + offset).round().max(0.0) as u64
}

/// Next base delay: grows by `factor`, clamped to `[initial, max]`.
pub fn next_base_millis(current: f64, factor: f64, initial: f64, max: f64) -> f64 {
    (current * factor).max(initial).min(max)
}
