use crate::error::{ServiceError, ServiceResult};
use crate::types::CreateSubscriptionRequest;

pub const MIN_INTERVAL_SECONDS: u64 = 3_600;
pub const MAX_INTERVAL_SECONDS: u64 = 31_536_000;
pub const MAX_AMOUNT: u64 = 1_000_000_000_000;
pub const MAX_REMINDER_DAYS: u8 = 30;
pub const MAX_SUB_ID_LEN: usize = 64;

/// Settlement-chain address length bounds (base58 text).
pub const MIN_ADDRESS_LEN: usize = 32;
pub const MAX_ADDRESS_LEN: usize = 44;

/// Quotas over Active subscriptions.
pub const MAX_PER_PRINCIPAL: usize = 100;
pub const MAX_TOTAL: usize = 10_000;

/// Synchronous request validation. Quota and uniqueness checks live with the
/// store, under the same lock as the insert.
pub fn validate_create(req: &CreateSubscriptionRequest) -> ServiceResult<()> {
    validate_sub_id(&req.sub_id)?;
    validate_address("settlement_contract", &req.settlement_contract)?;
    validate_address("token_mint", &req.token_mint)?;
    validate_address("payer", &req.payer)?;
    validate_address("merchant", &req.merchant)?;

    if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&req.interval_seconds) {
        return Err(ServiceError::Validation(format!(
            "interval_seconds must be within [{MIN_INTERVAL_SECONDS}, {MAX_INTERVAL_SECONDS}], got {}",
            req.interval_seconds
        )));
    }

    if req.amount_hint == 0 || req.amount_hint > MAX_AMOUNT {
        return Err(ServiceError::Validation(format!(
            "amount_hint must be within (0, {MAX_AMOUNT}], got {}",
            req.amount_hint
        )));
    }

    if req.reminder_days_before > MAX_REMINDER_DAYS {
        return Err(ServiceError::Validation(format!(
            "reminder_days_before must be at most {MAX_REMINDER_DAYS}, got {}",
            req.reminder_days_before
        )));
    }

    if req.api_key.trim().is_empty() {
        return Err(ServiceError::Validation("api_key is required".to_string()));
    }

    Ok(())
}

pub fn validate_sub_id(sub_id: &str) -> ServiceResult<()> {
    if sub_id.is_empty() || sub_id.len() > MAX_SUB_ID_LEN {
        return Err(ServiceError::Validation(format!(
            "sub_id length must be within 1..={MAX_SUB_ID_LEN}"
        )));
    }
    if !sub_id.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(ServiceError::Validation(
            "sub_id must be printable ASCII".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_address(field: &str, addr: &str) -> ServiceResult<()> {
    if !(MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&addr.len()) {
        return Err(ServiceError::Validation(format!(
            "{field} length must be within {MIN_ADDRESS_LEN}..={MAX_ADDRESS_LEN} chars"
        )));
    }
    if !addr.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
        return Err(ServiceError::Validation(format!(
            "{field} must be printable non-whitespace ASCII"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            sub_id: "sub-1".into(),
            settlement_contract: "C".repeat(32),
            token_mint: "M".repeat(44),
            payer: "P".repeat(40),
            merchant: "R".repeat(40),
            amount_hint: 10_000_000,
            interval_seconds: 3_600,
            reminder_days_before: 0,
            start_time: None,
            api_key: "key".into(),
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        assert!(validate_create(&req()).is_ok());
    }

    #[test]
    fn interval_bounds_are_inclusive() {
        let mut r = req();
        r.interval_seconds = 3_600;
        assert!(validate_create(&r).is_ok());
        r.interval_seconds = 31_536_000;
        assert!(validate_create(&r).is_ok());
        r.interval_seconds = 3_599;
        assert!(matches!(
            validate_create(&r),
            Err(ServiceError::Validation(_))
        ));
        r.interval_seconds = 31_536_001;
        assert!(matches!(
            validate_create(&r),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn amount_bounds() {
        let mut r = req();
        r.amount_hint = 0;
        assert!(validate_create(&r).is_err());
        r.amount_hint = MAX_AMOUNT;
        assert!(validate_create(&r).is_ok());
        r.amount_hint = MAX_AMOUNT + 1;
        assert!(validate_create(&r).is_err());
    }

    #[test]
    fn reminder_days_bounds() {
        let mut r = req();
        r.reminder_days_before = 30;
        assert!(validate_create(&r).is_ok());
        r.reminder_days_before = 31;
        assert!(validate_create(&r).is_err());
    }

    #[test]
    fn sub_id_charset_and_length() {
        assert!(validate_sub_id("a").is_ok());
        assert!(validate_sub_id(&"a".repeat(64)).is_ok());
        assert!(validate_sub_id("").is_err());
        assert!(validate_sub_id(&"a".repeat(65)).is_err());
        assert!(validate_sub_id("caf\u{e9}").is_err());
        assert!(validate_sub_id("has\ttab").is_err());
    }

    #[test]
    fn address_length_bounds() {
        assert!(validate_address("payer", &"x".repeat(31)).is_err());
        assert!(validate_address("payer", &"x".repeat(32)).is_ok());
        assert!(validate_address("payer", &"x".repeat(44)).is_ok());
        assert!(validate_address("payer", &"x".repeat(45)).is_err());
        assert!(validate_address("payer", &" ".repeat(33)).is_err());
    }
}
