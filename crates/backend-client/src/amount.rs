//! Conversions between fiat prices and atomic XMR amounts.

use xmrpos_common::{Error, Result};

/// Atomic units per XMR
pub const ATOMIC_UNITS_PER_XMR: i64 = 1_000_000_000_000;

/// Upper bound the backend accepts for required confirmations
pub const MAX_CONFIRMATIONS: u32 = 10;

/// Convert a fiat price into atomic units at `rate` fiat per XMR, rounding up
/// so the merchant is never short-changed.
pub fn fiat_to_atomic(fiat: f64, rate: f64) -> Result<i64> {
    if !fiat.is_finite() || fiat <= 0.0 {
        return Err(Error::InvalidAmount(format!("fiat amount {} must be positive", fiat)));
    }
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::InvalidAmount(format!("exchange rate {} must be positive", rate)));
    }

    let atomic = (fiat / rate * ATOMIC_UNITS_PER_XMR as f64).ceil();
    if atomic >= i64::MAX as f64 {
        return Err(Error::InvalidAmount(format!("{} XMR is out of range", fiat / rate)));
    }

    Ok(atomic as i64)
}

pub fn atomic_to_xmr(atomic: i64) -> f64 {
    atomic as f64 / ATOMIC_UNITS_PER_XMR as f64
}

/// Atomic amount as a plain decimal XMR string, trailing zeros trimmed
pub fn format_xmr(atomic: i64) -> String {
    let sign = if atomic < 0 { "-" } else { "" };
    let abs = atomic.unsigned_abs();
    let whole = abs / ATOMIC_UNITS_PER_XMR as u64;
    let frac = abs % ATOMIC_UNITS_PER_XMR as u64;

    if frac == 0 {
        return format!("{}{}", sign, whole);
    }

    let frac = format!("{:012}", frac);
    format!("{}{}.{}", sign, whole, frac.trim_end_matches('0'))
}

/// Payment URI encoded into the QR code and NFC tag
pub fn payment_uri(address: &str, atomic: i64) -> String {
    format!(
        "monero:{}?tx_amount={}&tx_description=XMRpos",
        address,
        format_xmr(atomic)
    )
}

/// Parse a confirmation setting such as `"0-conf"`, `"10-conf"` or `"2"`.
pub fn parse_confirmations(raw: &str) -> Result<u32> {
    let count = raw.trim().split('-').next().unwrap_or_default();
    let count: u32 = count
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid confirmation setting '{}'", raw)))?;

    validate_confirmations(count)?;
    Ok(count)
}

pub fn validate_confirmations(count: u32) -> Result<()> {
    if count > MAX_CONFIRMATIONS {
        return Err(Error::Configuration(format!(
            "required confirmations must be between 0 and {}, got {}",
            MAX_CONFIRMATIONS, count
        )));
    }
    Ok(())
}
