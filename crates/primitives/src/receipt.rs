use crate::{logs_bloom, Bloom, Log};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

/// Receipt containing result of transaction execution.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct Receipt {
    /// If transaction is executed successfully.
    pub success: bool,
    /// Gas used
    pub cumulative_gas_used: u64,
    /// Bloom filter of the logs.
    pub bloom: Bloom,
    /// Log send from contracts.
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Creates a receipt and derives its bloom from the logs.
    pub fn new(success: bool, cumulative_gas_used: u64, logs: Vec<Log>) -> Self {
        let bloom = logs_bloom(logs.iter());
        Self { success, cumulative_gas_used, bloom, logs }
    }
}
