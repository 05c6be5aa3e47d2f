use thiserror::Error;

use crate::config::COIN_DECIMALS;

#[derive(Debug, Error)]
pub enum CoinParseError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Too many decimals: maximum is {}", COIN_DECIMALS)]
    TooManyDecimals,
}

// Format any coin value using the requested decimals count
pub fn format_coin(value: u64, decimals: u8) -> String {
    let one = 10u64.pow(decimals as u32);
    let integer = value / one;
    let fraction = value % one;
    if fraction == 0 {
        return integer.to_string();
    }

    let formatted = format!("{:0width$}", fraction, width = decimals as usize);
    format!("{}.{}", integer, formatted.trim_end_matches('0'))
}

// Format a native unit value using the chain decimals
pub fn format_native(value: u64) -> String {
    format_coin(value, COIN_DECIMALS)
}

// Convert a human readable amount ("1.5") into native units
pub fn from_coin(value: &str, decimals: u8) -> Result<u64, CoinParseError> {
    let mut parts = value.splitn(2, '.');
    let integer: u64 = parts
        .next()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CoinParseError::InvalidAmount(value.to_owned()))?;

    let one = 10u64.pow(decimals as u32);
    let mut result = integer
        .checked_mul(one)
        .ok_or_else(|| CoinParseError::InvalidAmount(value.to_owned()))?;

    if let Some(fraction) = parts.next() {
        if fraction.len() > decimals as usize {
            return Err(CoinParseError::TooManyDecimals);
        }

        let parsed: u64 = fraction
            .parse()
            .map_err(|_| CoinParseError::InvalidAmount(value.to_owned()))?;
        let scale = 10u64.pow((decimals as usize - fraction.len()) as u32);
        result = result
            .checked_add(parsed * scale)
            .ok_or_else(|| CoinParseError::InvalidAmount(value.to_owned()))?;
    }

    Ok(result)
}
