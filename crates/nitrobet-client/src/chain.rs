//! On-chain client interface.
//!
//! Deposits, cooperative-close submission and force-close go through this
//! trait; the clearnode is never involved in a force-close.

use crate::signer::Signature;
use async_trait::async_trait;
use nitrobet_core::{Address, Amount, ChannelId, ChannelState};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block: u64,
    /// `false` if the transaction was mined but reverted.
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("transaction not confirmed: {0}")]
    Unconfirmed(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn approve(&self, token: &Address, spender: &Address, amount: Amount)
    -> Result<TxReceipt, ChainError>;

    async fn deposit(&self, token: &Address, amount: Amount) -> Result<TxReceipt, ChainError>;

    /// Submit a mutually signed final state.
    async fn close(
        &self,
        channel_id: &ChannelId,
        state: &ChannelState,
        signatures: &[Signature],
    ) -> Result<TxReceipt, ChainError>;

    /// Challenge with the latest known state, without the counterparty.
    async fn force_close(
        &self,
        channel_id: &ChannelId,
        state: Option<&ChannelState>,
    ) -> Result<TxReceipt, ChainError>;
}

/// A recorded chain call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCall {
    Approve { token: Address, spender: Address, amount: Amount },
    Deposit { token: Address, amount: Amount },
    Close { channel_id: ChannelId, version: u64 },
    ForceClose { channel_id: ChannelId },
}

/// In-process chain that confirms every transaction immediately.
#[derive(Debug, Default)]
pub struct SimulatedChain {
    calls: Mutex<Vec<ChainCall>>,
    block: AtomicU64,
    revert_deposits: bool,
    revert_approvals: AtomicBool,
    revert_force_close: bool,
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revert every deposit.
    pub fn reverting_deposits(mut self) -> Self {
        self.revert_deposits = true;
        self
    }

    /// Mine every approval as reverted.
    pub fn reverting_approvals(self) -> Self {
        self.set_revert_approvals(true);
        self
    }

    pub fn set_revert_approvals(&self, revert: bool) {
        self.revert_approvals.store(revert, Ordering::SeqCst);
    }

    /// Revert every force-close.
    pub fn reverting_force_close(mut self) -> Self {
        self.revert_force_close = true;
        self
    }

    pub fn calls(&self) -> Vec<ChainCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: ChainCall) -> TxReceipt {
        let block = self.block.fetch_add(1, Ordering::SeqCst) + 1;
        let tx_hash = format!("0x{:064x}", block);
        tracing::debug!(?call, block, "simulated transaction");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        TxReceipt {
            tx_hash,
            block,
            success: true,
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn approve(
        &self,
        token: &Address,
        spender: &Address,
        amount: Amount,
    ) -> Result<TxReceipt, ChainError> {
        let mut receipt = self.record(ChainCall::Approve {
            token: token.clone(),
            spender: spender.clone(),
            amount,
        });
        receipt.success = !self.revert_approvals.load(Ordering::SeqCst);
        Ok(receipt)
    }

    async fn deposit(&self, token: &Address, amount: Amount) -> Result<TxReceipt, ChainError> {
        if self.revert_deposits {
            return Err(ChainError::Reverted("deposit".into()));
        }
        Ok(self.record(ChainCall::Deposit {
            token: token.clone(),
            amount,
        }))
    }

    async fn close(
        &self,
        channel_id: &ChannelId,
        state: &ChannelState,
        signatures: &[Signature],
    ) -> Result<TxReceipt, ChainError> {
        if signatures.len() < 2 {
            return Err(ChainError::Reverted(format!(
                "close needs both signatures, got {}",
                signatures.len()
            )));
        }
        Ok(self.record(ChainCall::Close {
            channel_id: channel_id.clone(),
            version: state.version,
        }))
    }

    async fn force_close(
        &self,
        channel_id: &ChannelId,
        _state: Option<&ChannelState>,
    ) -> Result<TxReceipt, ChainError> {
        if self.revert_force_close {
            return Err(ChainError::Reverted("challenge".into()));
        }
        Ok(self.record(ChainCall::ForceClose {
            channel_id: channel_id.clone(),
        }))
    }
}

impl From<ChainError> for crate::error::ClientError {
    fn from(e: ChainError) -> Self {
        Self::OnChain(e.to_string())
    }
}
