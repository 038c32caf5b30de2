use crate::block::Transaction;
use crate::delta_utils::{AccountDeltas, DeltaError};
use crate::quantity::parse_hex;
use num_bigint::BigInt;

fn parse_field(field: &'static str, raw: &str) -> Result<BigInt, DeltaError> {
    parse_hex(raw)
        .map(BigInt::from)
        .map_err(|_| DeltaError::MalformedQuantity {
            field,
            raw: raw.to_string(),
        })
}

/// Computes the net value movement of every account referenced by one block.
///
/// The sender pays `gas * gasPrice` plus `value`, the recipient (if any) gets
/// `value`. A single malformed quantity fails the whole block.
pub fn extract_block_deltas(txs: &[Transaction]) -> Result<AccountDeltas, DeltaError> {
    let mut deltas = AccountDeltas::with_capacity(txs.len());
    for tx in txs.iter() {
        deltas.touch(&tx.from);

        let gas = parse_field("gas", &tx.gas)?;
        let gas_price = parse_field("gasPrice", &tx.gas_price)?;
        let value = parse_field("value", &tx.value)?;

        let fee = gas * gas_price;
        deltas.debit(&tx.from, &(fee + &value));

        if let Some(to) = tx.recipient() {
            deltas.credit(to, &value);
        }
    }

    Ok(deltas)
}
