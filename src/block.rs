use serde::Deserialize;

use crate::quantity::{parse_hex_u64, ParseQuantityError};

pub type BlockHeight = u64;

/// Block as returned by `eth_getBlockByNumber` with full transaction objects.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: String,
    #[serde(default)]
    pub miner: Option<String>,
    #[serde(default)]
    pub gas_used: Option<String>,
    /// in wei, absent before London
    #[serde(default)]
    pub base_fee_per_gas: Option<String>,
    #[serde(rename = "transactions", default)]
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn height(&self) -> Result<BlockHeight, ParseQuantityError> {
        parse_hex_u64(&self.number)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub from: String,
    /// `None` (or empty) for contract deployments
    #[serde(default)]
    pub to: Option<String>,
    /// gas units
    pub gas: String,
    /// wei per gas unit
    pub gas_price: String,
    /// wei
    pub value: String,
}

impl Transaction {
    pub fn recipient(&self) -> Option<&str> {
        self.to.as_deref().filter(|to| !to.is_empty())
    }

    pub fn is_contract_deployment(&self) -> bool {
        self.recipient().is_none()
    }
}
