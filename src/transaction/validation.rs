use crate::error::ChainError;

use super::types::Transaction;

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

impl Transaction {
    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let serialized = serde_json::to_vec(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }

    /// Shape and signature-presence checks. Balances are the wallet's concern.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.sender.trim().is_empty() {
            return Err(ChainError::InvalidTransaction("Sender must not be empty".to_string()));
        }
        if self.receiver.trim().is_empty() {
            return Err(ChainError::InvalidTransaction("Receiver must not be empty".to_string()));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(ChainError::InvalidTransaction(format!(
                "Amount must be a non-negative number, got {}",
                self.amount
            )));
        }
        if !self.has_required_signature() {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction from {} is missing a signature",
                self.sender
            )));
        }
        self.validate_size()
    }
}
