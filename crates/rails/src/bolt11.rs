//! Minimal BOLT11 helper: amount extraction from the human-readable part.
//!
//! Full invoice decoding (tagged fields, signature checks) stays on the node
//! side; the rails only need to confirm that an invoice handed back by a
//! destination wallet carries the amount that was asked for.

/// Parse the amount encoded in a BOLT11 invoice, in millisatoshis.
///
/// Returns `None` for amountless, malformed, or overflowing invoices, and for
/// pico amounts that do not land on a whole millisatoshi.
#[must_use]
pub fn amount_msats(bolt11: &str) -> Option<u64> {
    let lowered = bolt11.trim().to_ascii_lowercase();
    let rest = lowered.strip_prefix("ln")?;

    let digits_at = rest.find(|c: char| c.is_ascii_digit())?;
    if digits_at == 0 {
        return None;
    }
    let currency = &rest[..digits_at];
    if !currency.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }

    let tail = &rest[digits_at..];
    let digits_len = tail.bytes().take_while(u8::is_ascii_digit).count();
    let amount = tail[..digits_len].parse::<u64>().ok()?;

    let mut after = tail[digits_len..].bytes();
    match after.next() {
        // No multiplier: the amount is whole bitcoin, separator follows.
        Some(b'1') => amount.checked_mul(100_000_000_000),
        Some(b'm') if after.next() == Some(b'1') => amount.checked_mul(100_000_000),
        Some(b'u') if after.next() == Some(b'1') => amount.checked_mul(100_000),
        Some(b'n') if after.next() == Some(b'1') => amount.checked_mul(100),
        Some(b'p') if after.next() == Some(b'1') => {
            if amount % 10 != 0 {
                return None;
            }
            Some(amount / 10)
        }
        _ => None,
    }
}
