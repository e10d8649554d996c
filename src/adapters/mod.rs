pub mod http_transport;
pub mod loopback_transport;
pub mod memory;
pub mod postgres_receipt_ledger;
pub mod sqlite_ledger_store;

pub use http_transport::HttpAuthorityTransport;
pub use loopback_transport::LoopbackTransport;
pub use memory::{InMemoryLedgerStore, InMemoryReceiptLedger};
pub use postgres_receipt_ledger::PostgresReceiptLedger;
pub use sqlite_ledger_store::SqliteLedgerStore;
