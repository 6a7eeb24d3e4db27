//! In-memory fakes of the embedder and repository capabilities.

use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::repository::{
    IdentityRegistry, InsertOutcome, LedgerRepository, LedgerTxn, RepositoryError, SignatureRepository,
};
use crate::types::{
    AttendanceStatus, DetectedFace, Identity, KnownSignature, LedgerEntry, NewLedgerRow, Signature,
};
use chrono::{NaiveDate, Utc};
use image::RgbImage;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared count of `detect_and_embed` calls.
#[derive(Debug, Clone, Default)]
pub struct CallCount(Arc<AtomicUsize>);

impl CallCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Returns scripted detections, one entry per call; empty once exhausted.
pub struct FakeEmbedder {
    dim: usize,
    script: VecDeque<Vec<DetectedFace>>,
    calls: CallCount,
}

impl FakeEmbedder {
    pub fn new(dim: usize, script: Vec<Vec<DetectedFace>>) -> Self {
        Self {
            dim,
            script: script.into(),
            calls: CallCount::default(),
        }
    }

    pub fn calls(&self) -> CallCount {
        self.calls.clone()
    }
}

impl FaceEmbedder for FakeEmbedder {
    fn detect_and_embed(&mut self, _image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedderError> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.pop_front().unwrap_or_default())
    }

    fn signature_dim(&self) -> usize {
        self.dim
    }
}

#[derive(Default)]
struct Inner {
    identities: BTreeMap<String, Identity>,
    signatures: HashMap<String, Signature>,
    ledger: BTreeMap<(String, NaiveDate), NewLedgerRow>,
    fail_after_inserts: Option<usize>,
    racing_rows: Vec<NewLedgerRow>,
}

/// Registry, signature store and ledger backed by maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RepositoryError> {
        self.inner
            .lock()
            .map_err(|e| RepositoryError::Unavailable(format!("lock poisoned: {e}")))
    }

    /// Make every ledger transaction fail after `n` successful inserts.
    pub fn fail_ledger_inserts_after(&self, n: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_after_inserts = Some(n);
        }
    }

    /// Simulate a concurrent writer: `row` lands in the ledger at the moment
    /// a transaction tries to insert the same (identity, date), after its
    /// existence check has already passed.
    pub fn race_ledger_insert(&self, row: NewLedgerRow) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.racing_rows.push(row);
        }
    }

    /// Write a ledger row directly, bypassing reconciliation.
    pub fn seed_row(&self, row: NewLedgerRow) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.ledger.insert((row.identity_id.clone(), row.date), row);
        }
    }

    pub fn row_count(&self) -> usize {
        self.inner.lock().map(|i| i.ledger.len()).unwrap_or(0)
    }
}

impl IdentityRegistry for MemoryStore {
    fn register(
        &self,
        identity_id: &str,
        display_name: &str,
        signature: &Signature,
    ) -> Result<Identity, RepositoryError> {
        let mut inner = self.lock()?;
        if inner.identities.contains_key(identity_id) {
            return Err(RepositoryError::DuplicateIdentity(identity_id.to_string()));
        }
        let now = Utc::now();
        let identity = Identity {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.identities.insert(identity_id.to_string(), identity.clone());
        inner.signatures.insert(identity_id.to_string(), signature.clone());
        Ok(identity)
    }

    fn exists(&self, identity_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.lock()?.identities.contains_key(identity_id))
    }

    fn get(&self, identity_id: &str) -> Result<Option<Identity>, RepositoryError> {
        Ok(self.lock()?.identities.get(identity_id).cloned())
    }

    fn list(&self) -> Result<Vec<Identity>, RepositoryError> {
        Ok(self.lock()?.identities.values().cloned().collect())
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        Ok(self.lock()?.identities.len())
    }

    fn remove(&self, identity_id: &str) -> Result<bool, RepositoryError> {
        let mut inner = self.lock()?;
        let existed = inner.identities.remove(identity_id).is_some();
        inner.signatures.remove(identity_id);
        inner.ledger.retain(|(id, _), _| id != identity_id);
        Ok(existed)
    }
}

impl SignatureRepository for MemoryStore {
    fn put(&self, identity_id: &str, signature: &Signature) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        if !inner.identities.contains_key(identity_id) {
            return Err(RepositoryError::InvalidInput(format!("unknown identity {identity_id}")));
        }
        inner.signatures.insert(identity_id.to_string(), signature.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<KnownSignature>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .signatures
            .iter()
            .filter_map(|(id, signature)| {
                inner.identities.get(id).map(|identity| KnownSignature {
                    identity_id: id.clone(),
                    display_name: identity.display_name.clone(),
                    signature: signature.clone(),
                })
            })
            .collect())
    }

    fn delete(&self, identity_id: &str) -> Result<(), RepositoryError> {
        self.lock()?.signatures.remove(identity_id);
        Ok(())
    }
}

struct MemoryTxn<'a> {
    identities: &'a BTreeMap<String, Identity>,
    ledger: BTreeMap<(String, NaiveDate), NewLedgerRow>,
    inserts_left: Option<usize>,
    racing_rows: Vec<NewLedgerRow>,
}

impl LedgerTxn for MemoryTxn<'_> {
    fn identity_exists(&mut self, identity_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.identities.contains_key(identity_id))
    }

    fn registered_identities(&mut self) -> Result<Vec<String>, RepositoryError> {
        Ok(self.identities.keys().cloned().collect())
    }

    fn has_row(&mut self, identity_id: &str, date: NaiveDate) -> Result<bool, RepositoryError> {
        Ok(self.ledger.contains_key(&(identity_id.to_string(), date)))
    }

    fn insert_if_absent(&mut self, row: &NewLedgerRow) -> Result<InsertOutcome, RepositoryError> {
        if let Some(left) = self.inserts_left.as_mut() {
            if *left == 0 {
                return Err(RepositoryError::Unavailable("injected failure".into()));
            }
            *left -= 1;
        }
        if !self.identities.contains_key(&row.identity_id) {
            return Err(RepositoryError::InvalidInput(format!("unknown identity {}", row.identity_id)));
        }
        let key = (row.identity_id.clone(), row.date);
        if let Some(pos) = self
            .racing_rows
            .iter()
            .position(|r| r.identity_id == row.identity_id && r.date == row.date)
        {
            let racing = self.racing_rows.remove(pos);
            self.ledger.entry(key.clone()).or_insert(racing);
        }
        if self.ledger.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyMarked);
        }
        self.ledger.insert(key, row.clone());
        Ok(InsertOutcome::Inserted)
    }
}

impl LedgerRepository for MemoryStore {
    fn with_ledger_txn<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut dyn LedgerTxn) -> Result<T, RepositoryError>,
    {
        let mut inner = self.lock()?;
        let mut txn = MemoryTxn {
            identities: &inner.identities,
            ledger: inner.ledger.clone(),
            inserts_left: inner.fail_after_inserts,
            racing_rows: inner.racing_rows.clone(),
        };
        let result = f(&mut txn)?;
        let (committed, racing_left) = (txn.ledger, txn.racing_rows);
        inner.ledger = committed;
        inner.racing_rows = racing_left;
        Ok(result)
    }

    fn ledger_for(&self, date: NaiveDate) -> Result<Vec<LedgerEntry>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .ledger
            .values()
            .filter(|row| row.date == date)
            .filter_map(|row| {
                inner.identities.get(&row.identity_id).map(|identity| LedgerEntry {
                    identity_id: row.identity_id.clone(),
                    display_name: identity.display_name.clone(),
                    date: row.date,
                    status: row.status,
                    marked_at: row.marked_at,
                    source: Some(row.source.clone()),
                })
            })
            .collect())
    }

    fn present_counts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(NaiveDate, usize)>, RepositoryError> {
        let inner = self.lock()?;
        let mut counts: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for row in inner.ledger.values() {
            if row.date >= from && row.date <= to && row.status == AttendanceStatus::Present {
                *counts.entry(row.date).or_default() += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }
}
