use dos_primitives::{BlockNumber, Receipt, SealedBlock, B256};
use std::{fmt::Debug, sync::Arc};

/// Executes full blocks on top of the local state.
///
/// Used by full synchronisation, which imports every block by running its transactions instead
/// of trusting the state of a pivot.
pub trait BlockExecutor: Debug + Send + Sync {
    /// Execute the block and return the receipts it produced.
    fn execute(&self, block: &SealedBlock) -> Result<Vec<Receipt>, ExecutionError>;
}

impl<T: BlockExecutor + ?Sized> BlockExecutor for Arc<T> {
    fn execute(&self, block: &SealedBlock) -> Result<Vec<Receipt>, ExecutionError> {
        (**self).execute(block)
    }
}

/// BlockExecutor Errors
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Block {number} execution failed: {reason}")]
    Failed { number: BlockNumber, reason: String },
    #[error("Receipt root {got} is different from expected {expected}.")]
    ReceiptRootDiff { got: B256, expected: B256 },
    #[error("Parent state {root} of block {number} is missing.")]
    MissingState { number: BlockNumber, root: B256 },
}
