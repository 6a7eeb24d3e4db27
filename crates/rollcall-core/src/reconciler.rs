//! Converts recognized identities into a complete ledger for one date.
//!
//! Every (identity, date) row is written at most once: `Present` from
//! recognition or `Absent` from the fill pass, and never changed afterwards.
//! Re-running reconciliation for a date only fills in what is missing.

use crate::repository::{InsertOutcome, LedgerRepository, RepositoryError};
use crate::types::{AttendanceStatus, NewLedgerRow};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;

/// Source tag for rows written by the fill pass.
pub const FILL_SOURCE: &str = "system";

/// Mark `recognized` present for `date`, then mark every other registered
/// identity absent, all in one transaction.
///
/// Returns the ids newly marked present, in first-seen order. Unknown ids and
/// ids already holding a row for `date` are skipped silently.
pub fn reconcile<L, S>(
    ledger: &L,
    recognized: &[S],
    date: NaiveDate,
    source: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>, RepositoryError>
where
    L: LedgerRepository + ?Sized,
    S: AsRef<str>,
{
    let result = ledger.with_ledger_txn(|txn| {
        let mut seen = HashSet::new();
        let mut newly_present = Vec::new();

        for identity_id in recognized.iter().map(AsRef::as_ref) {
            if !seen.insert(identity_id) {
                continue;
            }
            if !txn.identity_exists(identity_id)? {
                tracing::debug!(identity_id, %date, "recognized identity is not registered; skipping");
                continue;
            }
            if txn.has_row(identity_id, date)? {
                continue;
            }

            let row = NewLedgerRow {
                identity_id: identity_id.to_string(),
                date,
                status: AttendanceStatus::Present,
                marked_at: now,
                source: source.to_string(),
            };
            match txn.insert_if_absent(&row)? {
                InsertOutcome::Inserted => newly_present.push(row.identity_id),
                InsertOutcome::AlreadyMarked => {
                    tracing::debug!(identity_id, %date, "row written concurrently; treating as marked")
                }
            }
        }

        let mut filled = 0usize;
        for identity_id in txn.registered_identities()? {
            if txn.has_row(&identity_id, date)? {
                continue;
            }
            let row = NewLedgerRow {
                identity_id,
                date,
                status: AttendanceStatus::Absent,
                marked_at: now,
                source: FILL_SOURCE.to_string(),
            };
            if txn.insert_if_absent(&row)? == InsertOutcome::Inserted {
                filled += 1;
            }
        }

        Ok((newly_present, filled))
    });

    let (newly_present, filled) = result?;
    tracing::info!(
        %date,
        source,
        present = newly_present.len(),
        absent_filled = filled,
        "ledger reconciled"
    );
    Ok(newly_present)
}
