//! Withdrawal settlement seam
//!
//! The orchestrator only does the balance bookkeeping. Moving funds is left
//! to whatever implements `SettlementService`; the bundled `PaperSettlement`
//! records the request and acknowledges it.

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub session_id: String,
    pub account_address: Option<String>,
    pub amount_eth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub reference: String,
    pub amount_eth: f64,
    pub settled_at: i64,
}

#[async_trait::async_trait]
pub trait SettlementService: Send + Sync {
    async fn settle_withdrawal(&self, req: &WithdrawalRequest) -> Result<SettlementReceipt>;
}

/// Acknowledges every valid request without touching the chain
#[derive(Default)]
pub struct PaperSettlement {
    settled: Mutex<Vec<SettlementReceipt>>,
}

impl PaperSettlement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settled(&self) -> Vec<SettlementReceipt> {
        self.settled.lock().clone()
    }
}

#[async_trait::async_trait]
impl SettlementService for PaperSettlement {
    async fn settle_withdrawal(&self, req: &WithdrawalRequest) -> Result<SettlementReceipt> {
        if !(req.amount_eth.is_finite() && req.amount_eth >= 0.0) {
            return Err(anyhow!("invalid withdrawal amount"));
        }

        let receipt = SettlementReceipt {
            reference: Uuid::new_v4().to_string(),
            amount_eth: req.amount_eth,
            settled_at: Utc::now().timestamp(),
        };
        info!(
            session_id = %req.session_id,
            amount_eth = req.amount_eth,
            reference = %receipt.reference,
            "📝 Paper withdrawal settled"
        );
        self.settled.lock().push(receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paper_settlement_records() {
        let s = PaperSettlement::new();
        let req = WithdrawalRequest {
            session_id: "s1".into(),
            account_address: None,
            amount_eth: 0.5,
        };
        let receipt = s.settle_withdrawal(&req).await.unwrap();
        assert_eq!(receipt.amount_eth, 0.5);
        assert_eq!(s.settled().len(), 1);

        let bad = WithdrawalRequest {
            amount_eth: f64::NAN,
            ..req
        };
        assert!(s.settle_withdrawal(&bad).await.is_err());
    }
}
