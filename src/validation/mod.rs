use bigdecimal::BigDecimal;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::domain::{CheckIn, Donation, Payload};
use crate::protocol::Submission;

pub const CURRENCY_CODE_LEN: usize = 3;
pub const CATEGORY_MAX_LEN: usize = 64;
pub const REFERENCE_MAX_LEN: usize = 128;
pub const DEVICE_ID_MAX_LEN: usize = 64;
pub const AMOUNT_MAX_SCALE: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

/// Branches the authority accepts submissions for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BranchPolicy {
    #[default]
    Any,
    Only(HashSet<Uuid>),
}

impl BranchPolicy {
    pub fn allows(&self, branch_id: &Uuid) -> bool {
        match self {
            BranchPolicy::Any => true,
            BranchPolicy::Only(branches) => branches.contains(branch_id),
        }
    }
}

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control() || ch.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

pub fn validate_currency_code(currency: &str) -> ValidationResult {
    let currency = sanitize_string(currency);
    validate_required("currency", &currency)?;

    if currency.len() != CURRENCY_CODE_LEN || !currency.chars().all(|ch| ch.is_ascii_uppercase())
    {
        return Err(ValidationError::new(
            "currency",
            format!("must be {} uppercase letters", CURRENCY_CODE_LEN),
        ));
    }

    Ok(())
}

pub fn validate_positive_amount(amount: &BigDecimal) -> ValidationResult {
    if amount <= &BigDecimal::from(0) {
        return Err(ValidationError::new("amount", "must be greater than zero"));
    }

    // Trailing zeros do not count: `10.500` is two decimal places.
    let (_, scale) = amount.normalized().as_bigint_and_exponent();
    if scale > AMOUNT_MAX_SCALE {
        return Err(ValidationError::new(
            "amount",
            format!("must have at most {} decimal places", AMOUNT_MAX_SCALE),
        ));
    }

    Ok(())
}

pub fn validate_reference(field: &'static str, value: &str) -> ValidationResult {
    let value = sanitize_string(value);
    validate_required(field, &value)?;
    validate_max_len(field, &value, REFERENCE_MAX_LEN)
}

fn validate_donation(donation: &Donation) -> ValidationResult {
    validate_positive_amount(&donation.amount)?;
    validate_currency_code(&donation.currency)?;
    if let Some(category) = &donation.category {
        validate_max_len("category", &sanitize_string(category), CATEGORY_MAX_LEN)?;
    }
    Ok(())
}

fn validate_check_in(check_in: &CheckIn) -> ValidationResult {
    validate_reference("member_id", &check_in.member_id)?;
    validate_reference("service_id", &check_in.service_id)
}

/// Authority-side checks run before a receipt number is allocated.
pub fn validate_submission(submission: &Submission, branches: &BranchPolicy) -> ValidationResult {
    validate_required("device_id", &submission.device_id)?;
    validate_max_len("device_id", &submission.device_id, DEVICE_ID_MAX_LEN)?;

    if submission.device_sequence <= 0 {
        return Err(ValidationError::new("device_sequence", "must be positive"));
    }

    if !branches.allows(&submission.branch_id) {
        return Err(ValidationError::new(
            "branch_id",
            format!("unknown branch {}", submission.branch_id),
        ));
    }

    match &submission.payload {
        Payload::Donation(donation) => validate_donation(donation),
        Payload::CheckIn(check_in) => validate_check_in(check_in),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::str::FromStr;

    fn submission(payload: Payload) -> Submission {
        Submission {
            id: Uuid::new_v4(),
            device_id: "kiosk-1".to_string(),
            device_sequence: 1,
            organization_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            payload,
            recorded_at: Utc::now(),
        }
    }

    fn donation(amount: &str, currency: &str) -> Payload {
        Payload::Donation(Donation {
            amount: BigDecimal::from_str(amount).expect("valid decimal"),
            currency: currency.to_string(),
            category: Some("offering".to_string()),
        })
    }

    #[test]
    fn validates_required_field() {
        assert!(validate_required("field", "value").is_ok());
        assert!(validate_required("field", "   ").is_err());
    }

    #[test]
    fn validates_max_len() {
        assert!(validate_max_len("field", "abc", 3).is_ok());
        assert!(validate_max_len("field", "abcd", 3).is_err());
    }

    #[test]
    fn sanitizes_string() {
        assert_eq!(sanitize_string("  hello\tworld  "), "hello world");
        assert_eq!(sanitize_string(" \n "), "");
        assert_eq!(sanitize_string("ab\u{0000}cd\u{0007}"), "abcd");
        assert_eq!(sanitize_string("first\nservice\r\nhall"), "first service hall");
    }

    #[test]
    fn validates_currency_code() {
        assert!(validate_currency_code("NGN").is_ok());
        assert!(validate_currency_code(" KES ").is_ok());
        assert!(validate_currency_code("ngn").is_err());
        assert!(validate_currency_code("NAIRA").is_err());
        assert!(validate_currency_code("").is_err());
    }

    #[test]
    fn validates_positive_amount() {
        let positive = BigDecimal::from_str("1.23").expect("valid decimal");
        let too_precise = BigDecimal::from_str("1.234").expect("valid decimal");

        assert!(validate_positive_amount(&positive).is_ok());
        assert!(validate_positive_amount(&BigDecimal::from(5000)).is_ok());
        assert!(validate_positive_amount(&BigDecimal::from(0)).is_err());
        assert!(validate_positive_amount(&BigDecimal::from(-1)).is_err());
        assert!(validate_positive_amount(&too_precise).is_err());
    }

    #[test]
    fn ignores_trailing_zeros_in_amount_scale() {
        let padded = BigDecimal::from_str("10.500").expect("valid decimal");
        let padded_whole = BigDecimal::from_str("2500.0000").expect("valid decimal");

        assert!(validate_positive_amount(&padded).is_ok());
        assert!(validate_positive_amount(&padded_whole).is_ok());
        assert!(validate_positive_amount(&BigDecimal::from_str("10.501").expect("valid decimal")).is_err());
    }

    #[test]
    fn accepts_well_formed_submissions() {
        assert!(validate_submission(&submission(donation("5000", "NGN")), &BranchPolicy::Any).is_ok());

        let check_in = Payload::CheckIn(CheckIn {
            member_id: "m-204".to_string(),
            service_id: "2024-06-02-first".to_string(),
        });
        assert!(validate_submission(&submission(check_in), &BranchPolicy::Any).is_ok());
    }

    #[test]
    fn rejects_unknown_branch() {
        let sub = submission(donation("10", "NGN"));
        let policy = BranchPolicy::Only(HashSet::from([Uuid::new_v4()]));
        let err = validate_submission(&sub, &policy).unwrap_err();
        assert_eq!(err.field, "branch_id");

        let policy = BranchPolicy::Only(HashSet::from([sub.branch_id]));
        assert!(validate_submission(&sub, &policy).is_ok());
    }

    #[test]
    fn rejects_malformed_payloads() {
        let err = validate_submission(&submission(donation("-5", "NGN")), &BranchPolicy::Any)
            .unwrap_err();
        assert_eq!(err.field, "amount");

        let blank_member = Payload::CheckIn(CheckIn {
            member_id: " ".to_string(),
            service_id: "s".to_string(),
        });
        let err = validate_submission(&submission(blank_member), &BranchPolicy::Any).unwrap_err();
        assert_eq!(err.field, "member_id");
    }
}
