//! Storage capabilities the engine needs. `rollcall-store` provides the
//! SQLite implementation; tests use in-memory fakes.

use crate::types::{Identity, KnownSignature, LedgerEntry, NewLedgerRow, Signature};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Store cannot be reached or the operation failed; retryable, nothing committed.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
    /// Rejected by a store constraint, e.g. a row for an unregistered identity.
    /// Retrying the same call fails the same way.
    #[error("rejected by store: {0}")]
    InvalidInput(String),
    #[error("identity already registered: {0}")]
    DuplicateIdentity(String),
}

/// Registered identities. Deleting an identity deletes its signature and
/// ledger rows.
pub trait IdentityRegistry {
    /// Insert the identity and its signature atomically.
    fn register(
        &self,
        identity_id: &str,
        display_name: &str,
        signature: &Signature,
    ) -> Result<Identity, RepositoryError>;

    fn exists(&self, identity_id: &str) -> Result<bool, RepositoryError>;

    fn get(&self, identity_id: &str) -> Result<Option<Identity>, RepositoryError>;

    /// All identities ordered by `identity_id`.
    fn list(&self) -> Result<Vec<Identity>, RepositoryError>;

    fn count(&self) -> Result<usize, RepositoryError>;

    /// Returns whether the identity existed.
    fn remove(&self, identity_id: &str) -> Result<bool, RepositoryError>;
}

/// One signature per identity, replaced on re-enrollment.
pub trait SignatureRepository {
    fn put(&self, identity_id: &str, signature: &Signature) -> Result<(), RepositoryError>;

    /// Every identity that currently has a signature. No ordering guarantee.
    fn load_all(&self) -> Result<Vec<KnownSignature>, RepositoryError>;

    /// Idempotent.
    fn delete(&self, identity_id: &str) -> Result<(), RepositoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row for (identity, date) already exists, possibly written by a
    /// concurrent reconciliation.
    AlreadyMarked,
}

/// Ledger operations available inside a write transaction.
pub trait LedgerTxn {
    fn identity_exists(&mut self, identity_id: &str) -> Result<bool, RepositoryError>;

    fn registered_identities(&mut self) -> Result<Vec<String>, RepositoryError>;

    fn has_row(&mut self, identity_id: &str, date: NaiveDate) -> Result<bool, RepositoryError>;

    /// Insert unless a row for (identity, date) exists. Uniqueness conflicts
    /// are reported as [`InsertOutcome::AlreadyMarked`], never as errors.
    fn insert_if_absent(&mut self, row: &NewLedgerRow) -> Result<InsertOutcome, RepositoryError>;
}

pub trait LedgerRepository {
    /// Run `f` inside one write transaction: commit on `Ok`, roll back on `Err`.
    fn with_ledger_txn<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut dyn LedgerTxn) -> Result<T, RepositoryError>;

    /// Rows for `date` ordered by `identity_id`.
    fn ledger_for(&self, date: NaiveDate) -> Result<Vec<LedgerEntry>, RepositoryError>;

    /// Present-row counts per date in `[from, to]`; dates without rows are omitted.
    fn present_counts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(NaiveDate, usize)>, RepositoryError>;
}
