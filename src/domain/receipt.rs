use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const RECEIPT_PREFIX: &str = "RCT-";
const RECEIPT_WIDTH: usize = 6;

/// Permanent, organization-scoped receipt number assigned by the authority.
///
/// Travels as a bare integer on the wire and in storage; `Display` renders the
/// printed form (`RCT-000123`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ReceiptNumber(u64);

impl ReceiptNumber {
    pub fn new(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_db(value: i64) -> Option<Self> {
        u64::try_from(value).ok().and_then(Self::new)
    }

    pub(crate) fn to_db(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}

impl fmt::Display for ReceiptNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:0width$}", RECEIPT_PREFIX, self.0, width = RECEIPT_WIDTH)
    }
}

impl TryFrom<u64> for ReceiptNumber {
    type Error = InvalidReceipt;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        ReceiptNumber::new(value).ok_or_else(|| InvalidReceipt(value.to_string()))
    }
}

impl From<ReceiptNumber> for u64 {
    fn from(receipt: ReceiptNumber) -> Self {
        receipt.0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid receipt number: {0}")]
pub struct InvalidReceipt(pub String);

impl FromStr for ReceiptNumber {
    type Err = InvalidReceipt;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix(RECEIPT_PREFIX).unwrap_or(trimmed);
        digits
            .parse::<u64>()
            .ok()
            .and_then(ReceiptNumber::new)
            .ok_or_else(|| InvalidReceipt(s.to_string()))
    }
}
