//! Infrastructure layer: journal stores, configuration and the posting
//! service that ties domain workflows to the ledger.

pub mod config;
pub mod journal_store;
pub mod service;


pub use config::{ConfigError, LedgerConfig};
pub use journal_store::{
    CommittedEntry, InMemoryJournalStore, JournalStore, JournalStoreError, PostgresJournalStore,
};
pub use service::{LedgerService, PostReceipt, ServiceError};
