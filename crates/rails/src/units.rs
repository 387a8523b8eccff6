//! Millisatoshi/satoshi arithmetic shared by the rails and the engine.

/// Millisatoshis per satoshi.
pub const MSATS_PER_SAT: u64 = 1_000;

#[must_use]
pub fn sats_to_msats(sats: u64) -> u64 {
    sats.saturating_mul(MSATS_PER_SAT)
}

/// Floor conversion; sub-satoshi remainders are dropped.
#[must_use]
pub fn msats_to_sats(msats: u64) -> u64 {
    msats / MSATS_PER_SAT
}

#[must_use]
pub fn msats_to_sats_ceil(msats: u64) -> u64 {
    msats.div_ceil(MSATS_PER_SAT)
}

/// `ceil(amount × percent / 100)` without intermediate overflow.
#[must_use]
pub fn ceil_percent(amount: u64, percent: u32) -> u64 {
    let scaled = u128::from(amount) * u128::from(percent);
    u64::try_from(scaled.div_ceil(100)).unwrap_or(u64::MAX)
}

/// Human-readable sats amount for wallet log messages ("1 sat", "9 sats").
#[must_use]
pub fn format_sats(sats: u64) -> String {
    if sats == 1 {
        "1 sat".to_string()
    } else {
        format!("{sats} sats")
    }
}
