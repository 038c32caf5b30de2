pub mod delta_accumulator;
pub mod delta_extraction;

pub use delta_accumulator::{AccountDeltas, MaxDelta};
pub use delta_extraction::extract_block_deltas;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("couldn't parse {field} of '{raw}'")]
    MalformedQuantity { field: &'static str, raw: String },
}
