use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Zero;

/// Number of decimal places between wei and ether.
pub const ETH_DECIMALS: usize = 18;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("'{raw}' is not a 0x-prefixed hex quantity")]
pub struct ParseQuantityError {
    pub raw: String,
}

/// Parses a `0x`-prefixed hex string into an exact non-negative integer.
pub fn parse_hex(raw: &str) -> Result<BigUint, ParseQuantityError> {
    let err = || ParseQuantityError {
        raw: raw.to_string(),
    };
    let digits = raw.strip_prefix("0x").ok_or_else(err)?;
    // from_str_radix accepts '_' separators and a leading '+', node quantities never carry those
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(err());
    }
    BigUint::parse_bytes(digits.as_bytes(), 16).ok_or_else(err)
}

pub fn parse_hex_u64(raw: &str) -> Result<u64, ParseQuantityError> {
    let value = parse_hex(raw)?;
    u64::try_from(value).map_err(|_| ParseQuantityError {
        raw: raw.to_string(),
    })
}

pub fn to_hex(value: u64) -> String {
    format!("0x{:x}", value)
}

/// Renders an amount of wei as ether, exactly, with trailing zeros trimmed.
pub fn format_units(wei: &BigInt) -> String {
    let unit = BigUint::from(10u32).pow(ETH_DECIMALS as u32);
    let whole = wei.magnitude() / &unit;
    let fraction = wei.magnitude() % &unit;

    let sign = if wei.sign() == Sign::Minus { "-" } else { "" };
    if fraction.is_zero() {
        return format!("{}{}", sign, whole);
    }
    let fraction = format!("{:0>width$}", fraction.to_string(), width = ETH_DECIMALS);
    format!("{}{}.{}", sign, whole, fraction.trim_end_matches('0'))
}
