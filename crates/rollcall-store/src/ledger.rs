use chrono::NaiveDate;
use rollcall_core::{
    InsertOutcome, LedgerEntry, LedgerRepository, LedgerTxn, NewLedgerRow, RepositoryError,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::codec::{format_date, is_uniqueness_violation, parse_date, parse_status, parse_timestamp};
use crate::{SqliteStore, StoreError};

/// Ledger operations on an open write transaction.
struct SqliteLedgerTxn<'a> {
    conn: &'a Connection,
}

impl LedgerTxn for SqliteLedgerTxn<'_> {
    fn identity_exists(&mut self, identity_id: &str) -> Result<bool, RepositoryError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM identities WHERE identity_id = ?1",
                params![identity_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(found.is_some())
    }

    fn registered_identities(&mut self) -> Result<Vec<String>, RepositoryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity_id FROM identities ORDER BY identity_id ASC")
            .map_err(StoreError::from)?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(StoreError::from)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(StoreError::from)?;
        Ok(ids)
    }

    fn has_row(&mut self, identity_id: &str, date: NaiveDate) -> Result<bool, RepositoryError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM ledger WHERE identity_id = ?1 AND date = ?2",
                params![identity_id, format_date(date)],
                |_| Ok(()),
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(found.is_some())
    }

    fn insert_if_absent(&mut self, row: &NewLedgerRow) -> Result<InsertOutcome, RepositoryError> {
        let inserted = self.conn.execute(
            "INSERT INTO ledger (identity_id, date, status, marked_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.identity_id,
                format_date(row.date),
                row.status.as_str(),
                row.marked_at.to_rfc3339(),
                row.source,
            ],
        );

        match inserted {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_uniqueness_violation(&err) => {
                tracing::debug!(
                    identity_id = %row.identity_id,
                    date = %row.date,
                    "ledger row already exists"
                );
                Ok(InsertOutcome::AlreadyMarked)
            }
            Err(err) => Err(StoreError::from(err).into()),
        }
    }
}

impl LedgerRepository for SqliteStore {
    fn with_ledger_txn<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut dyn LedgerTxn) -> Result<T, RepositoryError>,
    {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front, so two processes
        // reconciling the same date queue instead of interleaving.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let value = {
            let mut txn = SqliteLedgerTxn { conn: &tx };
            f(&mut txn)?
        };

        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    fn ledger_for(&self, date: NaiveDate) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT l.identity_id, i.display_name, l.date, l.status, l.marked_at, l.source
                 FROM ledger l
                 JOIN identities i ON i.identity_id = l.identity_id
                 WHERE l.date = ?1
                 ORDER BY l.identity_id ASC",
            )
            .map_err(StoreError::from)?;
        let mut rows = stmt.query(params![format_date(date)]).map_err(StoreError::from)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().map_err(StoreError::from)? {
            entries.push(row_to_entry(row)?);
        }
        Ok(entries)
    }

    fn present_counts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(NaiveDate, usize)>, RepositoryError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT date, COUNT(*) FROM ledger
                 WHERE status = 'Present' AND date BETWEEN ?1 AND ?2
                 GROUP BY date ORDER BY date ASC",
            )
            .map_err(StoreError::from)?;
        let mut rows = stmt
            .query(params![format_date(from), format_date(to)])
            .map_err(StoreError::from)?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().map_err(StoreError::from)? {
            let date: String = row.get(0).map_err(StoreError::from)?;
            let count: i64 = row.get(1).map_err(StoreError::from)?;
            counts.push((parse_date(&date)?, count.max(0) as usize));
        }
        Ok(counts)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<LedgerEntry, StoreError> {
    let date: String = row.get(2)?;
    let status: String = row.get(3)?;
    let marked_at: String = row.get(4)?;
    Ok(LedgerEntry {
        identity_id: row.get(0)?,
        display_name: row.get(1)?,
        date: parse_date(&date)?,
        status: parse_status(&status)?,
        marked_at: parse_timestamp(&marked_at)?,
        source: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollcall_core::reconciler::reconcile;
    use rollcall_core::report::{daily_summary, summary_range};
    use rollcall_core::{AttendanceStatus, IdentityRegistry, Signature};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, d).unwrap()
    }

    fn store_with(ids: &[(&str, &str)]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, name) in ids {
            store.register(id, name, &Signature::new(vec![1.0, 0.0])).unwrap();
        }
        store
    }

    fn present(id: &str, date: NaiveDate) -> NewLedgerRow {
        NewLedgerRow {
            identity_id: id.into(),
            date,
            status: AttendanceStatus::Present,
            marked_at: Utc::now(),
            source: "image".into(),
        }
    }

    #[test]
    fn test_reconcile_scenario() {
        let store = store_with(&[("STU001", "Alice"), ("STU002", "Bob")]);
        let marked = reconcile(&store, &["STU001"], day(1), "image", Utc::now()).unwrap();
        assert_eq!(marked, vec!["STU001".to_string()]);

        let ledger = store.ledger_for(day(1)).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].display_name, "Alice");
        assert_eq!(ledger[0].status, AttendanceStatus::Present);
        assert_eq!(ledger[0].source.as_deref(), Some("image"));
        assert_eq!(ledger[1].status, AttendanceStatus::Absent);
        assert_eq!(ledger[1].source.as_deref(), Some("system"));

        let summary = daily_summary(&store, &store, day(1)).unwrap();
        assert_eq!((summary.present_count, summary.absent_count), (1, 1));
        assert_eq!(summary.present_percent, 50.0);
    }

    #[test]
    fn test_reconcile_twice_is_idempotent() {
        let store = store_with(&[("STU001", "Alice"), ("STU002", "Bob")]);
        reconcile(&store, &["STU001"], day(2), "image", Utc::now()).unwrap();
        let before = store.ledger_for(day(2)).unwrap();

        let again = reconcile(&store, &["STU001", "STU002"], day(2), "image", Utc::now()).unwrap();
        assert!(again.is_empty());
        assert_eq!(store.ledger_for(day(2)).unwrap(), before);
    }

    #[test]
    fn test_insert_conflict_reported_as_already_marked() {
        let store = store_with(&[("STU001", "Alice")]);
        let outcomes = store
            .with_ledger_txn(|txn| {
                let first = txn.insert_if_absent(&present("STU001", day(3)))?;
                let second = txn.insert_if_absent(&present("STU001", day(3)))?;
                Ok((first, second))
            })
            .unwrap();
        assert_eq!(outcomes, (InsertOutcome::Inserted, InsertOutcome::AlreadyMarked));
        assert_eq!(store.ledger_for(day(3)).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = store_with(&[("STU001", "Alice")]);
        let result: Result<(), _> = store.with_ledger_txn(|txn| {
            txn.insert_if_absent(&present("STU001", day(4)))?;
            Err(RepositoryError::Unavailable("simulated".into()))
        });
        assert!(result.is_err());
        assert!(store.ledger_for(day(4)).unwrap().is_empty());
    }

    #[test]
    fn test_unregistered_insert_is_rejected() {
        let store = store_with(&[]);
        let result = store.with_ledger_txn(|txn| txn.insert_if_absent(&present("GHOST", day(5))));
        assert!(matches!(result, Err(RepositoryError::InvalidInput(_))));
        assert!(store.ledger_for(day(5)).unwrap().is_empty());
    }

    #[test]
    fn test_remove_identity_cascades_ledger() {
        let store = store_with(&[("STU001", "Alice"), ("STU002", "Bob")]);
        reconcile(&store, &["STU001"], day(6), "image", Utc::now()).unwrap();

        store.remove("STU001").unwrap();
        let ledger = store.ledger_for(day(6)).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].identity_id, "STU002");
    }

    #[test]
    fn test_summary_range_over_store() {
        let store = store_with(&[("STU001", "Alice"), ("STU002", "Bob")]);
        reconcile(&store, &["STU001", "STU002"], day(8), "image", Utc::now()).unwrap();

        let days = summary_range(&store, &store, day(7), day(9)).unwrap();
        let counts: Vec<(usize, usize)> =
            days.iter().map(|d| (d.present_count, d.absent_count)).collect();
        assert_eq!(counts, vec![(0, 2), (2, 0), (0, 2)]);
    }

    #[test]
    fn test_concurrent_stores_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let a = SqliteStore::open(&path).unwrap();
        a.register("STU001", "Alice", &Signature::new(vec![1.0])).unwrap();
        a.register("STU002", "Bob", &Signature::new(vec![1.0])).unwrap();
        let b = SqliteStore::open(&path).unwrap();

        let handles: Vec<_> = [a, b]
            .into_iter()
            .map(|store| {
                std::thread::spawn(move || {
                    reconcile(&store, &["STU001"], day(10), "image", Utc::now()).unwrap()
                })
            })
            .collect();
        let marked: Vec<Vec<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(marked.iter().map(Vec::len).sum::<usize>(), 1);
        let check = SqliteStore::open(&path).unwrap();
        assert_eq!(check.ledger_for(day(10)).unwrap().len(), 2);
    }
}
