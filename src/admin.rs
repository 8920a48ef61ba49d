use crate::error::{ServiceError, ServiceResult};
use crate::types::{CycleState, CycleStatus, FeeAddressGovernance, Principal};
use crate::validate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Mandatory waiting period between proposing and executing a fee-address
/// change.
pub const FEE_CHANGE_DELAY_SECS: i64 = 7 * 86_400;

/// Admin and reader principals. Admins get full control; readers get
/// query-only access to privileged fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acl {
    pub admins: BTreeSet<Principal>,
    pub readers: BTreeSet<Principal>,
    /// One-shot: set once the first admin exists, by configuration or by
    /// `initialize_first_admin`.
    pub bootstrapped: bool,
}

impl Acl {
    pub fn new(initial_admin: Option<Principal>) -> Self {
        let mut acl = Self::default();
        if let Some(admin) = initial_admin {
            acl.admins.insert(admin);
            acl.bootstrapped = true;
        }
        acl
    }

    pub fn is_admin(&self, caller: &str) -> bool {
        self.admins.contains(caller)
    }

    pub fn is_reader(&self, caller: &str) -> bool {
        self.admins.contains(caller) || self.readers.contains(caller)
    }

    pub fn require_admin(&self, caller: &str) -> ServiceResult<()> {
        if self.is_admin(caller) {
            Ok(())
        } else {
            Err(ServiceError::Authorization(format!(
                "caller '{caller}' is not an admin"
            )))
        }
    }

    pub fn require_reader(&self, caller: &str) -> ServiceResult<()> {
        if self.is_reader(caller) {
            Ok(())
        } else {
            Err(ServiceError::Authorization(format!(
                "caller '{caller}' has no read access"
            )))
        }
    }

    /// Permitted only while the admin set is empty; the caller becomes the
    /// first admin.
    pub fn initialize_first_admin(&mut self, caller: &str) -> ServiceResult<()> {
        if self.bootstrapped || !self.admins.is_empty() {
            return Err(ServiceError::Conflict(
                "an admin is already configured".to_string(),
            ));
        }
        self.admins.insert(caller.to_string());
        self.bootstrapped = true;
        tracing::info!(principal = caller, "first admin initialized");
        Ok(())
    }

    pub fn add_admin(&mut self, principal: Principal) {
        self.admins.insert(principal);
    }

    pub fn remove_admin(&mut self, principal: &str) -> ServiceResult<()> {
        if !self.admins.contains(principal) {
            return Err(ServiceError::NotFound(format!(
                "'{principal}' is not an admin"
            )));
        }
        if self.admins.len() == 1 {
            return Err(ServiceError::Conflict(
                "cannot remove the last admin".to_string(),
            ));
        }
        self.admins.remove(principal);
        Ok(())
    }

    pub fn add_reader(&mut self, principal: Principal) {
        self.readers.insert(principal);
    }

    pub fn remove_reader(&mut self, principal: &str) -> ServiceResult<()> {
        if !self.readers.remove(principal) {
            return Err(ServiceError::NotFound(format!(
                "'{principal}' is not a reader"
            )));
        }
        Ok(())
    }
}

/// At most one pending proposal at a time.
pub fn propose_fee_address_change(
    gov: &mut FeeAddressGovernance,
    proposed_addr: String,
    now: i64,
) -> ServiceResult<()> {
    validate::validate_address("fee_address", &proposed_addr)?;
    match gov {
        FeeAddressGovernance::Pending { .. } => Err(ServiceError::Conflict(
            "a fee address proposal is already pending".to_string(),
        )),
        FeeAddressGovernance::Stable { current_addr } => {
            *gov = FeeAddressGovernance::Pending {
                current_addr: current_addr.clone(),
                proposed_addr,
                proposed_at: now,
            };
            Ok(())
        }
    }
}

/// Fails until the proposal is at least `FEE_CHANGE_DELAY_SECS` old. Returns
/// the address that became current.
pub fn execute_fee_address_change(
    gov: &mut FeeAddressGovernance,
    now: i64,
) -> ServiceResult<String> {
    match gov {
        FeeAddressGovernance::Stable { .. } => Err(ServiceError::Conflict(
            "no pending fee address proposal".to_string(),
        )),
        FeeAddressGovernance::Pending {
            proposed_addr,
            proposed_at,
            ..
        } => {
            let age = now - *proposed_at;
            if age < FEE_CHANGE_DELAY_SECS {
                return Err(ServiceError::Conflict(format!(
                    "fee address proposal is {age}s old; {FEE_CHANGE_DELAY_SECS}s required"
                )));
            }
            let addr = proposed_addr.clone();
            *gov = FeeAddressGovernance::Stable {
                current_addr: addr.clone(),
            };
            Ok(addr)
        }
    }
}

pub fn cancel_fee_address_proposal(gov: &mut FeeAddressGovernance) -> ServiceResult<()> {
    match gov {
        FeeAddressGovernance::Stable { .. } => Err(ServiceError::Conflict(
            "no pending fee address proposal".to_string(),
        )),
        FeeAddressGovernance::Pending { current_addr, .. } => {
            *gov = FeeAddressGovernance::Stable {
                current_addr: current_addr.clone(),
            };
            Ok(())
        }
    }
}

pub fn cycle_status(cycles: &CycleState) -> CycleStatus {
    CycleStatus {
        current: cycles.balance,
        threshold: cycles.threshold,
        auto_refill_enabled: cycles.auto_refill_enabled,
        total_consumed: cycles.total_consumed,
        total_refilled: cycles.total_refilled,
        last_refill: cycles.last_refill_at,
    }
}

pub fn refill_from_fees(cycles: &mut CycleState, amount: u64, now: i64) {
    cycles.balance = cycles.balance.saturating_add(amount);
    cycles.total_refilled = cycles.total_refilled.saturating_add(amount);
    cycles.last_refill_at = Some(now);
}
