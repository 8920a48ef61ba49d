use crate::admin;
use crate::error::{ServiceError, ServiceResult};
use crate::license::LicenseRegistry;
use crate::rpc::{SettlementRpc, SubmitResult};
use crate::scheduler::{Clock, Scheduler, MAX_CONSECUTIVE_FAILURES};
use crate::signer::Signer;
use crate::store::StatePersister;
use crate::types::{
    CanisterHealth, CoreState, CreateSubscriptionRequest, CycleStatus, FeeAddressGovernance,
    HealthStatus, SharedState, SubId, SubStatus, Subscription,
};
use crate::validate::{self, MAX_PER_PRINCIPAL, MAX_TOTAL};
use crate::wire;
use std::sync::Arc;

/// Encrypted metadata blobs are opaque and size-bounded; the core never
/// decrypts them.
const MAX_METADATA_BYTES: usize = 8 * 1024;

const MAX_LIST_LIMIT: usize = 500;

/// Caller-facing facade. Every operation takes the caller principal and is
/// atomic with respect to every other operation, interleaving only at
/// suspension points (signing, RPC, license outcalls).
pub struct CadenceService<R, S, L> {
    state: SharedState,
    scheduler: Arc<Scheduler<R, S>>,
    rpc: Arc<R>,
    signer: Arc<S>,
    license: Arc<L>,
    persister: Arc<StatePersister>,
    clock: Arc<dyn Clock>,
}

impl<R: SettlementRpc, S: Signer, L: LicenseRegistry> CadenceService<R, S, L> {
    pub fn new(
        state: SharedState,
        scheduler: Arc<Scheduler<R, S>>,
        rpc: Arc<R>,
        signer: Arc<S>,
        license: Arc<L>,
        persister: Arc<StatePersister>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state,
            scheduler,
            rpc,
            signer,
            license,
            persister,
            clock,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<R, S>> {
        &self.scheduler
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    // ---- lifecycle -------------------------------------------------------

    pub async fn create_subscription(
        &self,
        caller: &str,
        req: CreateSubscriptionRequest,
    ) -> ServiceResult<Subscription> {
        validate::validate_create(&req)?;

        // License check is an outcall; uniqueness and quotas are re-checked
        // under the lock afterwards.
        let info = self.license.validate_license(&req.api_key).await?;
        if !info.is_valid {
            return Err(ServiceError::Validation("invalid api key".to_string()));
        }
        if info.rate_limit_remaining == 0 {
            return Err(ServiceError::Validation(
                "api key quota exhausted".to_string(),
            ));
        }

        let now = self.clock.now();
        let sub = Subscription {
            sub_id: req.sub_id.clone(),
            settlement_contract: req.settlement_contract,
            token_mint: req.token_mint,
            payer: req.payer,
            merchant: req.merchant,
            amount_hint: req.amount_hint,
            interval_seconds: req.interval_seconds,
            reminder_days_before: req.reminder_days_before,
            status: SubStatus::Active,
            next_execution_at: req.start_time.unwrap_or(now) + req.interval_seconds as i64,
            last_triggered_at: None,
            trigger_count: 0,
            failed_payment_count: 0,
            last_failure_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            owner_principal: caller.to_string(),
        };

        {
            let mut core = self.state.lock().await;
            ensure_mutable(&core)?;
            if core.store.active_count() >= MAX_TOTAL {
                return Err(ServiceError::Validation(
                    "global active subscription limit reached".to_string(),
                ));
            }
            if core.store.active_count_for(caller) >= MAX_PER_PRINCIPAL {
                return Err(ServiceError::Validation(
                    "per-caller active subscription limit reached".to_string(),
                ));
            }
            core.store.insert_new(sub.clone())?;
            self.persist(&mut core);
        }

        self.scheduler.arm_for_subscription(&sub, now);

        if let Err(err) = self.license.consume_license_usage(&req.api_key).await {
            tracing::warn!(error = %err, "failed to consume license usage");
        }

        tracing::info!(
            sub_id = %sub.sub_id,
            owner = caller,
            next_execution_at = sub.next_execution_at,
            interval = sub.interval_seconds,
            "subscription created"
        );
        Ok(sub)
    }

    pub async fn get_subscription(&self, caller: &str, sub_id: &str) -> ServiceResult<Subscription> {
        let core = self.state.lock().await;
        let sub = core
            .store
            .get(sub_id)
            .ok_or_else(|| ServiceError::NotFound(format!("subscription '{sub_id}'")))?;
        if sub.owner_principal != caller && !core.acl.is_reader(caller) {
            return Err(ServiceError::Authorization(format!(
                "caller '{caller}' cannot read '{sub_id}'"
            )));
        }
        Ok(sub.clone())
    }

    /// Page through a principal's subscriptions in `(created_at, sub_id)`
    /// order. Reading someone else's list requires the reader role.
    pub async fn list_subscriptions(
        &self,
        caller: &str,
        owner: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> ServiceResult<Vec<Subscription>> {
        let core = self.state.lock().await;
        let target = owner.unwrap_or(caller);
        if target != caller {
            core.acl.require_reader(caller)?;
        }
        Ok(core
            .store
            .list_by_principal(target, limit.clamp(1, MAX_LIST_LIMIT), cursor))
    }

    pub async fn pause_subscription(&self, caller: &str, sub_id: &str) -> ServiceResult<()> {
        {
            let mut core = self.state.lock().await;
            ensure_mutable(&core)?;
            require_owner_or_admin(&core, caller, sub_id)?;
            let sub = core
                .store
                .get(sub_id)
                .ok_or_else(|| ServiceError::NotFound(format!("subscription '{sub_id}'")))?;
            if sub.status != SubStatus::Active {
                return Err(ServiceError::Conflict(format!(
                    "subscription '{sub_id}' is not active"
                )));
            }
            let now = self.clock.now();
            core.store.update(sub_id, |s| {
                s.status = SubStatus::Paused;
                s.updated_at = now;
            });
            self.persist(&mut core);
        }
        self.scheduler.cancel_timers(sub_id);
        tracing::info!(sub_id, caller, "subscription paused");
        Ok(())
    }

    pub async fn resume_subscription(&self, caller: &str, sub_id: &str) -> ServiceResult<()> {
        let now = self.clock.now();
        let snap = {
            let mut core = self.state.lock().await;
            ensure_mutable(&core)?;
            require_owner_or_admin(&core, caller, sub_id)?;
            let sub = core
                .store
                .get(sub_id)
                .ok_or_else(|| ServiceError::NotFound(format!("subscription '{sub_id}'")))?;
            if sub.status != SubStatus::Paused {
                return Err(ServiceError::Conflict(format!(
                    "subscription '{sub_id}' is not paused"
                )));
            }
            let Some(snap) = core.store.update(sub_id, |s| {
                s.status = SubStatus::Active;
                // An auto-paused subscription restarts with a clean failure
                // counter; a user pause keeps its counters untouched.
                if s.failed_payment_count >= MAX_CONSECUTIVE_FAILURES {
                    s.failed_payment_count = 0;
                }
                s.updated_at = now;
            }) else {
                return Err(ServiceError::NotFound(format!("subscription '{sub_id}'")));
            };
            core.emergency_paused.remove(sub_id);
            self.persist(&mut core);
            snap
        };

        // An overdue subscription fires immediately rather than waiting a
        // full period.
        self.scheduler
            .arm_payment(sub_id, snap.next_execution_at.max(now));
        if let Some(reminder_at) = snap.reminder_at() {
            if reminder_at > now {
                self.scheduler.arm_reminder(sub_id, reminder_at);
            }
        }
        tracing::info!(sub_id, caller, next_execution_at = snap.next_execution_at, "subscription resumed");
        Ok(())
    }

    /// Succeeds immediately even when a dispatch for this subscription is
    /// mid-flight; the in-flight outcome is discarded on return.
    pub async fn cancel_subscription(&self, caller: &str, sub_id: &str) -> ServiceResult<()> {
        {
            let mut core = self.state.lock().await;
            ensure_mutable(&core)?;
            require_owner_or_admin(&core, caller, sub_id)?;
            let sub = core
                .store
                .get(sub_id)
                .ok_or_else(|| ServiceError::NotFound(format!("subscription '{sub_id}'")))?;
            if sub.status.is_terminal() {
                return Err(ServiceError::Conflict(format!(
                    "subscription '{sub_id}' is already cancelled"
                )));
            }
            let now = self.clock.now();
            core.store.update(sub_id, |s| {
                s.status = SubStatus::Cancelled;
                s.updated_at = now;
            });
            core.emergency_paused.remove(sub_id);
            self.persist(&mut core);
        }
        self.scheduler.cancel_timers(sub_id);
        tracing::info!(sub_id, caller, "subscription cancelled");
        Ok(())
    }

    /// Delete cancelled entries whose last mutation is older than the
    /// argument. Entries are retained for audit until then.
    pub async fn cleanup_old_subscriptions(
        &self,
        caller: &str,
        older_than: i64,
    ) -> ServiceResult<usize> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;

        let victims: Vec<SubId> = core
            .store
            .iter()
            .filter(|s| s.status.is_terminal() && s.updated_at < older_than)
            .map(|s| s.sub_id.clone())
            .collect();
        for sub_id in &victims {
            core.store.remove(sub_id);
            core.metadata.remove(sub_id);
        }
        if !victims.is_empty() {
            self.persist(&mut core);
        }
        tracing::info!(caller, removed = victims.len(), "cleaned up old subscriptions");
        Ok(victims.len())
    }

    /// Admin-only migration tool. Addresses are otherwise immutable after
    /// creation; normal flows never call this.
    pub async fn update_subscription_addresses(
        &self,
        caller: &str,
        sub_id: &str,
        payer: Option<String>,
        merchant: Option<String>,
    ) -> ServiceResult<Subscription> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        if let Some(payer) = &payer {
            validate::validate_address("payer", payer)?;
        }
        if let Some(merchant) = &merchant {
            validate::validate_address("merchant", merchant)?;
        }
        let now = self.clock.now();
        let snap = core
            .store
            .update(sub_id, |s| {
                if let Some(payer) = payer {
                    s.payer = payer;
                }
                if let Some(merchant) = merchant {
                    s.merchant = merchant;
                }
                s.updated_at = now;
            })
            .ok_or_else(|| ServiceError::NotFound(format!("subscription '{sub_id}'")))?;
        self.persist(&mut core);
        tracing::warn!(sub_id, caller, "subscription addresses migrated by admin");
        Ok(snap)
    }

    // ---- encrypted metadata ---------------------------------------------

    pub async fn put_encrypted_metadata(
        &self,
        caller: &str,
        sub_id: &str,
        blob_b64: String,
    ) -> ServiceResult<()> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(blob_b64.as_bytes())
            .map_err(|e| ServiceError::Validation(format!("metadata is not valid base64: {e}")))?;
        if decoded.is_empty() || decoded.len() > MAX_METADATA_BYTES {
            return Err(ServiceError::Validation(format!(
                "metadata must be within 1..={MAX_METADATA_BYTES} bytes"
            )));
        }

        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        require_owner_or_admin(&core, caller, sub_id)?;
        core.metadata.insert(sub_id.to_string(), blob_b64);
        self.persist(&mut core);
        Ok(())
    }

    pub async fn get_encrypted_metadata(
        &self,
        caller: &str,
        sub_id: &str,
    ) -> ServiceResult<Option<String>> {
        let core = self.state.lock().await;
        require_owner_or_admin_or_reader(&core, caller, sub_id)?;
        Ok(core.metadata.get(sub_id).cloned())
    }

    /// Admin-only erasure path; independent of subscription lifecycle.
    pub async fn delete_encrypted_metadata(&self, caller: &str, sub_id: &str) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        if core.metadata.remove(sub_id).is_none() {
            return Err(ServiceError::NotFound(format!("no metadata for '{sub_id}'")));
        }
        self.persist(&mut core);
        Ok(())
    }

    // ---- ACL -------------------------------------------------------------

    pub async fn initialize_first_admin(&self, caller: &str) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.initialize_first_admin(caller)?;
        self.persist(&mut core);
        Ok(())
    }

    pub async fn add_admin(&self, caller: &str, principal: String) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        if principal.is_empty() {
            return Err(ServiceError::Validation("principal is empty".to_string()));
        }
        core.acl.add_admin(principal);
        self.persist(&mut core);
        Ok(())
    }

    pub async fn remove_admin(&self, caller: &str, principal: &str) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        core.acl.remove_admin(principal)?;
        self.persist(&mut core);
        Ok(())
    }

    pub async fn add_reader(&self, caller: &str, principal: String) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        if principal.is_empty() {
            return Err(ServiceError::Validation("principal is empty".to_string()));
        }
        core.acl.add_reader(principal);
        self.persist(&mut core);
        Ok(())
    }

    pub async fn remove_reader(&self, caller: &str, principal: &str) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        core.acl.remove_reader(principal)?;
        self.persist(&mut core);
        Ok(())
    }

    // ---- fee governance --------------------------------------------------

    pub async fn propose_fee_address_change(&self, caller: &str, addr: String) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        let now = self.clock.now();
        admin::propose_fee_address_change(&mut core.fee_governance, addr, now)?;
        self.persist(&mut core);
        tracing::info!(caller, "fee address change proposed");
        Ok(())
    }

    pub async fn execute_fee_address_change(&self, caller: &str) -> ServiceResult<String> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        let now = self.clock.now();
        let addr = admin::execute_fee_address_change(&mut core.fee_governance, now)?;
        self.persist(&mut core);
        tracing::info!(caller, "fee address change executed");
        Ok(addr)
    }

    pub async fn cancel_fee_address_proposal(&self, caller: &str) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        admin::cancel_fee_address_proposal(&mut core.fee_governance)?;
        self.persist(&mut core);
        Ok(())
    }

    pub async fn get_fee_governance(&self, caller: &str) -> ServiceResult<FeeAddressGovernance> {
        let core = self.state.lock().await;
        core.acl.require_reader(caller)?;
        Ok(core.fee_governance.clone())
    }

    // ---- emergency controls ---------------------------------------------

    /// Pause every Active subscription and cancel its timers. Returns the
    /// count paused.
    pub async fn emergency_pause_all(&self, caller: &str) -> ServiceResult<usize> {
        let paused: Vec<SubId> = {
            let mut core = self.state.lock().await;
            ensure_mutable(&core)?;
            core.acl.require_admin(caller)?;
            let now = self.clock.now();

            let active: Vec<SubId> = core
                .store
                .iter()
                .filter(|s| s.status == SubStatus::Active)
                .map(|s| s.sub_id.clone())
                .collect();
            for sub_id in &active {
                core.store.update(sub_id, |s| {
                    s.status = SubStatus::Paused;
                    s.updated_at = now;
                });
                core.emergency_paused.insert(sub_id.clone());
            }
            self.persist(&mut core);
            active
        };

        for sub_id in &paused {
            self.scheduler.cancel_timers(sub_id);
        }
        tracing::warn!(caller, paused = paused.len(), "emergency pause engaged");
        Ok(paused.len())
    }

    /// Resume exactly the subscriptions the last emergency pause stopped.
    /// Subscriptions paused by their owners beforehand stay paused.
    pub async fn resume_operations(&self, caller: &str) -> ServiceResult<usize> {
        let now = self.clock.now();
        let resumed: Vec<Subscription> = {
            let mut core = self.state.lock().await;
            ensure_mutable(&core)?;
            core.acl.require_admin(caller)?;

            let ids: Vec<SubId> = core.emergency_paused.iter().cloned().collect();
            core.emergency_paused.clear();

            let mut resumed = Vec::new();
            for sub_id in ids {
                let still_paused = core
                    .store
                    .get(&sub_id)
                    .map(|s| s.status == SubStatus::Paused)
                    .unwrap_or(false);
                if !still_paused {
                    continue;
                }
                if let Some(snap) = core.store.update(&sub_id, |s| {
                    s.status = SubStatus::Active;
                    s.updated_at = now;
                }) {
                    resumed.push(snap);
                }
            }
            self.persist(&mut core);
            resumed
        };

        for snap in &resumed {
            self.scheduler
                .arm_payment(&snap.sub_id, snap.next_execution_at.max(now));
            if let Some(reminder_at) = snap.reminder_at() {
                if reminder_at > now {
                    self.scheduler.arm_reminder(&snap.sub_id, reminder_at);
                }
            }
        }
        tracing::warn!(caller, resumed = resumed.len(), "operations resumed");
        Ok(resumed.len())
    }

    // ---- cycles ----------------------------------------------------------

    pub async fn get_cycle_status(&self, caller: &str) -> ServiceResult<CycleStatus> {
        let core = self.state.lock().await;
        core.acl.require_reader(caller)?;
        Ok(admin::cycle_status(&core.cycles))
    }

    pub async fn set_cycle_threshold(&self, caller: &str, threshold: u64) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        core.cycles.threshold = threshold;
        self.persist(&mut core);
        Ok(())
    }

    pub async fn enable_auto_refill(&self, caller: &str, enabled: bool) -> ServiceResult<()> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        core.cycles.auto_refill_enabled = enabled;
        self.persist(&mut core);
        Ok(())
    }

    pub async fn refill_cycles_from_fees(&self, caller: &str, amount: u64) -> ServiceResult<u64> {
        let mut core = self.state.lock().await;
        ensure_mutable(&core)?;
        core.acl.require_admin(caller)?;
        admin::refill_from_fees(&mut core.cycles, amount, self.clock.now());
        self.persist(&mut core);
        Ok(core.cycles.balance)
    }

    // ---- withdrawals -----------------------------------------------------

    /// Transfer from the canister's own settlement-chain address. Does not
    /// touch the subscription store.
    pub async fn admin_withdraw_sol(
        &self,
        caller: &str,
        recipient: &str,
        lamports: u64,
    ) -> ServiceResult<String> {
        self.withdraw(caller, wire::OPCODE_WITHDRAW_SOL, recipient, None, lamports)
            .await
    }

    pub async fn admin_withdraw_token(
        &self,
        caller: &str,
        recipient: &str,
        mint: &str,
        amount: u64,
    ) -> ServiceResult<String> {
        validate::validate_address("token_mint", mint)?;
        self.withdraw(caller, wire::OPCODE_WITHDRAW_TOKEN, recipient, Some(mint), amount)
            .await
    }

    async fn withdraw(
        &self,
        caller: &str,
        opcode_byte: u8,
        recipient: &str,
        mint: Option<&str>,
        amount: u64,
    ) -> ServiceResult<String> {
        {
            let core = self.state.lock().await;
            ensure_mutable(&core)?;
            core.acl.require_admin(caller)?;
        }
        validate::validate_address("recipient", recipient)?;
        if amount == 0 {
            return Err(ServiceError::Validation("amount must be positive".to_string()));
        }

        let payload =
            wire::encode_transfer_payload(opcode_byte, recipient, mint, amount, self.clock.now());
        let signature = self.signer.sign(&payload).await?;
        let blob = wire::assemble_blob(&payload, &signature, &self.signer.public_key());

        match self.rpc.submit(&blob).await {
            SubmitResult::Submitted { tx_id } => {
                tracing::info!(caller, recipient, amount, %tx_id, "admin withdrawal submitted");
                Ok(tx_id)
            }
            SubmitResult::RejectedByChain { reason } => Err(ServiceError::ChainReject(reason)),
            SubmitResult::NetworkError { reason } => Err(ServiceError::Transient(reason)),
        }
    }

    // ---- diagnostics -----------------------------------------------------

    pub fn ping(&self) -> &'static str {
        "pong"
    }

    pub async fn get_canister_health(&self) -> CanisterHealth {
        let core = self.state.lock().await;
        let (active, paused, failing) = core.store.status_counts();
        let status = if core.fatal.is_some() || core.cycles.below_floor() {
            HealthStatus::Critical
        } else if failing > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
        CanisterHealth {
            status,
            active_subscriptions: active,
            paused_subscriptions: paused,
            failing_subscriptions: failing,
            cycle_balance: core.cycles.balance,
            cycle_threshold: core.cycles.threshold,
        }
    }

    fn persist(&self, core: &mut CoreState) {
        if let Err(err) = self.persister.save(core) {
            tracing::error!(error = %err, "failed to persist state");
            core.fatal = Some(format!("persistence failure: {err}"));
        }
    }
}

fn ensure_mutable(core: &CoreState) -> ServiceResult<()> {
    match &core.fatal {
        Some(reason) => Err(ServiceError::Fatal(reason.clone())),
        None => Ok(()),
    }
}

fn require_owner_or_admin(core: &CoreState, caller: &str, sub_id: &str) -> ServiceResult<()> {
    match core.store.get(sub_id) {
        None => Err(ServiceError::NotFound(format!("subscription '{sub_id}'"))),
        Some(sub) if sub.owner_principal == caller || core.acl.is_admin(caller) => Ok(()),
        Some(_) => Err(ServiceError::Authorization(format!(
            "caller '{caller}' does not own '{sub_id}'"
        ))),
    }
}

fn require_owner_or_admin_or_reader(
    core: &CoreState,
    caller: &str,
    sub_id: &str,
) -> ServiceResult<()> {
    match core.store.get(sub_id) {
        None => Err(ServiceError::NotFound(format!("subscription '{sub_id}'"))),
        Some(sub) if sub.owner_principal == caller || core.acl.is_reader(caller) => Ok(()),
        Some(_) => Err(ServiceError::Authorization(format!(
            "caller '{caller}' cannot read '{sub_id}'"
        ))),
    }
}
