//! Domain layer: entities and the lifecycle they obey.

pub mod receipt;
pub mod status;
pub mod transaction;

pub use receipt::{InvalidReceipt, ReceiptNumber};
pub use status::{check_transition, Actor, IllegalTransition, TransactionStatus};
pub use transaction::{
    CheckIn, Donation, LifecycleError, Payload, StatusChange, SyncBookkeeping, Transaction,
    TransactionDraft,
};
