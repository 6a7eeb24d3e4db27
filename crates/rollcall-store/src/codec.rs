//! Column encodings shared by the repositories.

use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{AttendanceStatus, Signature};
use rusqlite::ffi;

use crate::StoreError;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn encode_signature(signature: &Signature) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(signature.values.as_slice()));
    for &value in &signature.values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_signature(blob: &[u8], dim: i64) -> Result<Signature, StoreError> {
    let dim = usize::try_from(dim)
        .map_err(|_| StoreError::InvalidValue(format!("negative signature dimension {dim}")))?;
    if blob.len() != dim * 4 {
        return Err(StoreError::InvalidValue(format!(
            "signature blob is {} bytes, expected {} for {dim} dimensions",
            blob.len(),
            dim * 4
        )));
    }

    Ok(Signature::new(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    ))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| StoreError::InvalidValue(format!("date '{value}': {e}")))
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidValue(format!("timestamp '{value}': {e}")))
}

pub fn parse_status(value: &str) -> Result<AttendanceStatus, StoreError> {
    value.parse().map_err(StoreError::InvalidValue)
}

/// True when the error is a primary-key or unique-index violation.
pub fn is_uniqueness_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// True when the error is a foreign-key or CHECK violation: the row itself
/// is invalid, so retrying cannot succeed.
pub fn is_integrity_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY
                || e.extended_code == ffi::SQLITE_CONSTRAINT_CHECK
    )
}
