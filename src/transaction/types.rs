/// Transaction types for TuCoin
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sender used for system-issued transactions such as mining rewards.
pub const SYSTEM_SENDER: &str = "0";

/// A value transfer waiting in the mempool or recorded in a block.
///
/// The signature is opaque: only its presence is checked, never its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: Option<String>,
}

impl Transaction {
    /// Create an unsigned transaction stamped with the current time.
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, amount: f64) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            signature: None,
        }
    }

    /// Reward paid by the system to a block producer.
    pub fn reward(beneficiary: impl Into<String>, amount: f64) -> Self {
        Self::new(SYSTEM_SENDER, beneficiary, amount)
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn is_system(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }

    /// System transactions need no signature; everything else needs a non-empty one.
    pub fn has_required_signature(&self) -> bool {
        if self.is_system() {
            return true;
        }
        matches!(&self.signature, Some(sig) if !sig.is_empty())
    }

    /// Digest of the unsigned fields, the message a wallet signs.
    pub fn digest(&self) -> String {
        let unsigned = serde_json::json!({
            "sender": self.sender,
            "receiver": self.receiver,
            "amount": self.amount,
            "timestamp": self.timestamp,
        });
        hex::encode(Sha256::digest(unsigned.to_string().as_bytes()))
    }
}
