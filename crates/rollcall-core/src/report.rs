//! Daily attendance summaries.
//!
//! The total is the number of identities registered now; absent is derived as
//! `total - present`, so `present + absent == total` holds for every day,
//! including days that were never reconciled.

use crate::pipeline::round_to;
use crate::repository::{IdentityRegistry, LedgerRepository, RepositoryError};
use crate::types::DailySummary;
use chrono::NaiveDate;
use std::collections::HashMap;

pub fn summarize(date: NaiveDate, total_identities: usize, present_count: usize) -> DailySummary {
    let present_count = present_count.min(total_identities);
    let present_percent = if total_identities == 0 {
        0.0
    } else {
        round_to(present_count as f64 / total_identities as f64 * 100.0, 2)
    };

    DailySummary {
        date,
        total_identities,
        present_count,
        absent_count: total_identities - present_count,
        present_percent,
    }
}

pub fn daily_summary<R, L>(registry: &R, ledger: &L, date: NaiveDate) -> Result<DailySummary, RepositoryError>
where
    R: IdentityRegistry + ?Sized,
    L: LedgerRepository + ?Sized,
{
    let total = registry.count()?;
    let present = ledger
        .present_counts(date, date)?
        .into_iter()
        .find(|(d, _)| *d == date)
        .map_or(0, |(_, n)| n);
    Ok(summarize(date, total, present))
}

/// One summary per day in `[from, to]`; empty when `from > to`.
pub fn summary_range<R, L>(
    registry: &R,
    ledger: &L,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailySummary>, RepositoryError>
where
    R: IdentityRegistry + ?Sized,
    L: LedgerRepository + ?Sized,
{
    if from > to {
        return Ok(Vec::new());
    }

    let total = registry.count()?;
    let present: HashMap<NaiveDate, usize> = ledger.present_counts(from, to)?.into_iter().collect();

    Ok(from
        .iter_days()
        .take_while(|d| *d <= to)
        .map(|d| summarize(d, total, present.get(&d).copied().unwrap_or(0)))
        .collect())
}
