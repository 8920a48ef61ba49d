use crate::rpc::{SettlementRpc, SubmitResult, TxStatus};
use crate::signer::Signer;
use crate::types::{Opcode, SharedState, SubStatus};
use crate::wire;
use std::{sync::Arc, time::Duration};

/// Classified end state of one dispatch attempt. The dispatcher is
/// side-effect free on the store; the scheduler applies state transitions
/// from this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Submitted and confirmed on-chain.
    Success { tx_id: String },
    /// The settlement contract refused the transaction. Not retryable as-is;
    /// counts as a consecutive failure.
    ChainReject(String),
    /// Network-level failure; retryable.
    Transient(String),
    /// Submitted, still unconfirmed after the bounded wait. Scheduled like a
    /// transient failure, and `next_execution_at` must not advance.
    Unknown { tx_id: String },
    /// The subscription was missing or no longer Active at dispatch time.
    Skipped(String),
}

pub struct Dispatcher<R, S> {
    state: SharedState,
    rpc: Arc<R>,
    signer: Arc<S>,
    /// Status polls after a submit before giving up with Unknown.
    confirmation_polls: u32,
    confirmation_poll_interval: Duration,
}

impl<R: SettlementRpc, S: Signer> Dispatcher<R, S> {
    pub fn new(
        state: SharedState,
        rpc: Arc<R>,
        signer: Arc<S>,
        confirmation_polls: u32,
        confirmation_poll_interval: Duration,
    ) -> Self {
        Self {
            state,
            rpc,
            signer,
            confirmation_polls,
            confirmation_poll_interval,
        }
    }

    /// Load, build the canonical payload, sign, submit, classify. Suspends
    /// inside `sign` and the RPC calls; everything else is synchronous.
    pub async fn dispatch(&self, sub_id: &str, opcode: Opcode) -> DispatchOutcome {
        let sub = {
            let core = self.state.lock().await;
            match core.store.get(sub_id) {
                None => return DispatchOutcome::Skipped(format!("'{sub_id}' not found")),
                Some(sub) if sub.status != SubStatus::Active => {
                    return DispatchOutcome::Skipped(format!(
                        "'{sub_id}' is not active ({:?})",
                        sub.status
                    ))
                }
                Some(sub) => sub.clone(),
            }
        };

        let payload = wire::encode_payment_payload(&sub, opcode);

        let signature = match self.signer.sign(&payload).await {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(sub_id, ?opcode, error = %err, "signing failed");
                return DispatchOutcome::Transient(format!("signer: {err}"));
            }
        };

        let blob = wire::assemble_blob(&payload, &signature, &self.signer.public_key());

        match self.rpc.submit(&blob).await {
            SubmitResult::Submitted { tx_id } => self.await_confirmation(sub_id, tx_id).await,
            SubmitResult::RejectedByChain { reason } => {
                tracing::warn!(sub_id, ?opcode, %reason, "chain rejected submission");
                DispatchOutcome::ChainReject(reason)
            }
            SubmitResult::NetworkError { reason } => {
                tracing::warn!(sub_id, ?opcode, %reason, "submission failed");
                DispatchOutcome::Transient(reason)
            }
        }
    }

    /// Bounded confirmation wait. A transaction still pending at the end of
    /// the budget is Unknown: the chain may yet execute it, so the caller
    /// must treat it as a failure without advancing the schedule.
    async fn await_confirmation(&self, sub_id: &str, tx_id: String) -> DispatchOutcome {
        for poll in 0..self.confirmation_polls.max(1) {
            if poll > 0 && !self.confirmation_poll_interval.is_zero() {
                tokio::time::sleep(self.confirmation_poll_interval).await;
            }
            match self.rpc.get_tx_status(&tx_id).await {
                TxStatus::Confirmed => {
                    tracing::info!(sub_id, %tx_id, "dispatch confirmed");
                    return DispatchOutcome::Success { tx_id };
                }
                TxStatus::Failed(reason) => {
                    tracing::warn!(sub_id, %tx_id, %reason, "dispatch failed on-chain");
                    return DispatchOutcome::ChainReject(reason);
                }
                TxStatus::Pending | TxStatus::Unknown => {}
            }
        }
        tracing::warn!(sub_id, %tx_id, "dispatch still unconfirmed after bounded wait");
        DispatchOutcome::Unknown { tx_id }
    }
}
