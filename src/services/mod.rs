pub mod allocator;
pub mod ledger;
pub mod reconciler;
pub mod retry;

pub use allocator::ReceiptAllocator;
pub use ledger::{DeviceLedger, StatusChanged};
pub use reconciler::{PullReport, PushReport, SyncReconciler, SyncSettings};
pub use retry::{RetryDecision, RetryPolicy};
