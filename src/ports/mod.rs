pub mod authority;
pub mod device;

pub use authority::{AuthorityError, AuthorityResult, LedgerEntry, ReceiptLedger, Recorded};
pub use device::{
    AuthorityTransport, LedgerStore, SequenceSource, StoreError, StoreResult, TransportError,
};
