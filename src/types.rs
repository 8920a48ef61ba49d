use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Caller-supplied opaque subscription identifier. Unique across the store.
pub type SubId = String;

/// Opaque caller identity. The daemon maps local invocations to the
/// configured operator principal.
pub type Principal = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubStatus {
    Active,
    Paused,
    Cancelled,
    /// Reserved for bounded-duration subscriptions. Never set by the core;
    /// treated like `Cancelled` wherever it is read.
    Expired,
}

impl SubStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubStatus::Cancelled | SubStatus::Expired)
    }
}

/// One-byte action discriminator sent to the settlement contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Opcode {
    Payment,
    Reminder,
}

impl Opcode {
    pub fn wire_byte(self) -> u8 {
        match self {
            Opcode::Payment => 0x00,
            Opcode::Reminder => 0x01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub sub_id: SubId,
    /// Settlement-chain contract address, stored as text.
    pub settlement_contract: String,
    /// Token identifier used to route opcodes. The amount lives on the
    /// settlement chain.
    pub token_mint: String,
    pub payer: String,
    pub merchant: String,
    /// Advisory amount in smallest token units. The settlement contract holds
    /// the authoritative value.
    pub amount_hint: u64,
    pub interval_seconds: u64,
    /// 0 disables reminders.
    pub reminder_days_before: u8,
    pub status: SubStatus,
    /// Seconds since Unix epoch. Advances by exactly `interval_seconds` on a
    /// successful payment tick; never on failure or reminder.
    pub next_execution_at: i64,
    #[serde(default)]
    pub last_triggered_at: Option<i64>,
    /// Payment ticks that completed successfully on-chain.
    #[serde(default)]
    pub trigger_count: u64,
    /// Consecutive unsuccessful payment ticks since the last success.
    #[serde(default)]
    pub failed_payment_count: u32,
    #[serde(default)]
    pub last_failure_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: i64,
    /// Last mutation timestamp; drives `cleanup_old_subscriptions`.
    #[serde(default)]
    pub updated_at: i64,
    pub owner_principal: Principal,
}

impl Subscription {
    /// Fire time for the pre-payment reminder, if reminders are enabled.
    pub fn reminder_at(&self) -> Option<i64> {
        if self.reminder_days_before == 0 {
            return None;
        }
        Some(self.next_execution_at - i64::from(self.reminder_days_before) * 86_400)
    }
}

/// Two-stage fee-address governance. Executing a pending proposal requires a
/// seven-day waiting period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "stage")]
pub enum FeeAddressGovernance {
    Stable {
        current_addr: String,
    },
    Pending {
        current_addr: String,
        proposed_addr: String,
        proposed_at: i64,
    },
}

impl FeeAddressGovernance {
    pub fn current_addr(&self) -> &str {
        match self {
            FeeAddressGovernance::Stable { current_addr }
            | FeeAddressGovernance::Pending { current_addr, .. } => current_addr,
        }
    }
}

/// Cycle accounting. Pure bookkeeping: the scheduler refuses to dispatch when
/// the balance falls below the threshold and health degrades to Critical.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CycleState {
    pub balance: u64,
    pub threshold: u64,
    pub auto_refill_enabled: bool,
    #[serde(default)]
    pub total_consumed: u64,
    #[serde(default)]
    pub total_refilled: u64,
    #[serde(default)]
    pub last_refill_at: Option<i64>,
}

impl CycleState {
    pub fn below_floor(&self) -> bool {
        self.balance < self.threshold
    }
}

/// Snapshot returned by `get_cycle_status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CycleStatus {
    pub current: u64,
    pub threshold: u64,
    pub auto_refill_enabled: bool,
    pub total_consumed: u64,
    pub total_refilled: u64,
    pub last_refill: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanisterHealth {
    pub status: HealthStatus,
    pub active_subscriptions: usize,
    pub paused_subscriptions: usize,
    /// Active subscriptions currently in a backoff cycle.
    pub failing_subscriptions: usize,
    pub cycle_balance: u64,
    pub cycle_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub sub_id: SubId,
    pub settlement_contract: String,
    pub token_mint: String,
    pub payer: String,
    pub merchant: String,
    pub amount_hint: u64,
    pub interval_seconds: u64,
    pub reminder_days_before: u8,
    /// First period starts here if given, otherwise at creation time. The
    /// first payment fires one interval later.
    pub start_time: Option<i64>,
    pub api_key: String,
}

/// The core mutex. Held only between suspension points; any read-modify-write
/// that crosses an outcall re-reads before writing.
pub type SharedState = std::sync::Arc<tokio::sync::Mutex<CoreState>>;

/// Full mutable service state guarded by the core mutex.
#[derive(Debug)]
pub struct CoreState {
    pub store: crate::store::SubscriptionStore,
    pub acl: crate::admin::Acl,
    pub fee_governance: FeeAddressGovernance,
    pub cycles: CycleState,
    /// Opaque write-through blobs, base64 text, never decrypted here.
    pub metadata: BTreeMap<SubId, String>,
    /// Subscriptions paused by the last `emergency_pause_all`, so
    /// `resume_operations` resumes exactly those.
    pub emergency_paused: BTreeSet<SubId>,
    /// Set when persistence or the signer fails irrecoverably. While set, all
    /// mutations are refused.
    pub fatal: Option<String>,
}

impl CoreState {
    /// Fresh deployment state. When no initial admin is configured the admin
    /// set starts empty and the first caller of `initialize_first_admin`
    /// claims it.
    pub fn new(initial_admin: Option<Principal>, fee_address: String, cycles: CycleState) -> Self {
        Self {
            store: crate::store::SubscriptionStore::new(),
            acl: crate::admin::Acl::new(initial_admin),
            fee_governance: FeeAddressGovernance::Stable {
                current_addr: fee_address,
            },
            cycles,
            metadata: BTreeMap::new(),
            emergency_paused: BTreeSet::new(),
            fatal: None,
        }
    }
}
