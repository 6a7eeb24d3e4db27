use chrono::Utc;
use rollcall_core::{
    Identity, IdentityRegistry, KnownSignature, RepositoryError, Signature, SignatureRepository,
};
use rusqlite::{params, OptionalExtension, Row};

use crate::codec::{decode_signature, encode_signature, is_uniqueness_violation, parse_timestamp};
use crate::{SqliteStore, StoreError};

fn row_to_identity(row: &Row<'_>) -> Result<Identity, StoreError> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Identity {
        identity_id: row.get("identity_id")?,
        display_name: row.get("display_name")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

impl IdentityRegistry for SqliteStore {
    fn register(
        &self,
        identity_id: &str,
        display_name: &str,
        signature: &Signature,
    ) -> Result<Identity, RepositoryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        let now = Utc::now();

        let inserted = tx.execute(
            "INSERT INTO identities (identity_id, display_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![identity_id, display_name, now.to_rfc3339()],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_uniqueness_violation(&err) => {
                return Err(RepositoryError::DuplicateIdentity(identity_id.to_string()))
            }
            Err(err) => return Err(StoreError::from(err).into()),
        }

        tx.execute(
            "INSERT INTO signatures (identity_id, dim, vector, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                identity_id,
                signature.dim() as i64,
                encode_signature(signature),
                now.to_rfc3339()
            ],
        )
        .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;

        tracing::debug!(identity_id, dim = signature.dim(), "identity registered");
        Ok(Identity {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    fn exists(&self, identity_id: &str) -> Result<bool, RepositoryError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM identities WHERE identity_id = ?1",
                params![identity_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(found.is_some())
    }

    fn get(&self, identity_id: &str) -> Result<Option<Identity>, RepositoryError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT identity_id, display_name, created_at, updated_at
                 FROM identities WHERE identity_id = ?1",
            )
            .map_err(StoreError::from)?;
        let mut rows = stmt.query(params![identity_id]).map_err(StoreError::from)?;
        match rows.next().map_err(StoreError::from)? {
            Some(row) => Ok(Some(row_to_identity(row)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<Identity>, RepositoryError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT identity_id, display_name, created_at, updated_at
                 FROM identities ORDER BY identity_id ASC",
            )
            .map_err(StoreError::from)?;
        let mut rows = stmt.query([]).map_err(StoreError::from)?;

        let mut identities = Vec::new();
        while let Some(row) = rows.next().map_err(StoreError::from)? {
            identities.push(row_to_identity(row)?);
        }
        Ok(identities)
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))
            .map_err(StoreError::from)?;
        Ok(count.max(0) as usize)
    }

    fn remove(&self, identity_id: &str) -> Result<bool, RepositoryError> {
        let conn = self.lock()?;
        // Signature and ledger rows go with it via ON DELETE CASCADE.
        let removed = conn
            .execute("DELETE FROM identities WHERE identity_id = ?1", params![identity_id])
            .map_err(StoreError::from)?;
        if removed > 0 {
            tracing::info!(identity_id, "identity removed");
        }
        Ok(removed > 0)
    }
}

impl SignatureRepository for SqliteStore {
    fn put(&self, identity_id: &str, signature: &Signature) -> Result<(), RepositoryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO signatures (identity_id, dim, vector, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity_id) DO UPDATE SET
                dim = excluded.dim,
                vector = excluded.vector,
                updated_at = excluded.updated_at",
            params![
                identity_id,
                signature.dim() as i64,
                encode_signature(signature),
                now
            ],
        )
        .map_err(StoreError::from)?;
        tx.execute(
            "UPDATE identities SET updated_at = ?2 WHERE identity_id = ?1",
            params![identity_id, now],
        )
        .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<KnownSignature>, RepositoryError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT s.identity_id, i.display_name, s.dim, s.vector
                 FROM signatures s
                 JOIN identities i ON i.identity_id = s.identity_id",
            )
            .map_err(StoreError::from)?;
        let mut rows = stmt.query([]).map_err(StoreError::from)?;

        let mut known = Vec::new();
        while let Some(row) = rows.next().map_err(StoreError::from)? {
            let dim: i64 = row.get(2).map_err(StoreError::from)?;
            let blob: Vec<u8> = row.get(3).map_err(StoreError::from)?;
            known.push(KnownSignature {
                identity_id: row.get(0).map_err(StoreError::from)?,
                display_name: row.get(1).map_err(StoreError::from)?,
                signature: decode_signature(&blob, dim)?,
            });
        }
        Ok(known)
    }

    fn delete(&self, identity_id: &str) -> Result<(), RepositoryError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM signatures WHERE identity_id = ?1", params![identity_id])
            .map_err(StoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(values: &[f32]) -> Signature {
        Signature::new(values.to_vec())
    }

    #[test]
    fn test_register_and_load() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register("STU001", "Alice", &sig(&[0.5, -1.0])).unwrap();

        assert!(store.exists("STU001").unwrap());
        assert!(!store.exists("STU002").unwrap());
        assert_eq!(store.count().unwrap(), 1);

        let known = store.load_all().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].identity_id, "STU001");
        assert_eq!(known[0].display_name, "Alice");
        assert_eq!(known[0].signature.values, vec![0.5, -1.0]);
    }

    #[test]
    fn test_register_duplicate_keeps_original() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register("STU001", "Alice", &sig(&[1.0])).unwrap();

        let err = store.register("STU001", "Mallory", &sig(&[2.0])).unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateIdentity(id) if id == "STU001"));
        assert_eq!(store.get("STU001").unwrap().unwrap().display_name, "Alice");
        assert_eq!(store.load_all().unwrap()[0].signature.values, vec![1.0]);
    }

    #[test]
    fn test_put_overwrites() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register("STU001", "Alice", &sig(&[1.0, 0.0])).unwrap();
        store.put("STU001", &sig(&[0.0, 1.0])).unwrap();

        let known = store.load_all().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].signature.values, vec![0.0, 1.0]);
        let identity = store.get("STU001").unwrap().unwrap();
        assert!(identity.updated_at >= identity.created_at);
    }

    #[test]
    fn test_put_for_unregistered_identity_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.put("GHOST", &sig(&[1.0])).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidInput(_)));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_idempotent_and_hides_identity() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register("STU001", "Alice", &sig(&[1.0])).unwrap();

        store.delete("STU001").unwrap();
        store.delete("STU001").unwrap();
        store.delete("NOBODY").unwrap();

        assert!(store.load_all().unwrap().is_empty());
        assert!(store.exists("STU001").unwrap());
    }

    #[test]
    fn test_list_ordered_and_remove() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register("STU002", "Bob", &sig(&[1.0])).unwrap();
        store.register("STU001", "Alice", &sig(&[1.0])).unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|i| i.identity_id).collect();
        assert_eq!(ids, vec!["STU001", "STU002"]);

        assert!(store.remove("STU001").unwrap());
        assert!(!store.remove("STU001").unwrap());
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
