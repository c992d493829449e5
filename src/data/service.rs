//! Ingestion, backfill and reprocessing of feature rows.
//!
//! Every entry point recomputes rows from observations and upserts them by
//! key, so repeating a call for the same hours converges to the same rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::common::error::{PipelineError, PipelineResult};
use crate::common::log::StageTimer;
use crate::common::time::{call_with_timeout, hour_floor, hours, HOUR};

use super::domain::{
    FeatureKey, FeatureRow, FeatureStore, Gap, Location, LocationId, Observation,
    ObservationSource, UpsertReport,
};
use super::features::{derive_row, ObservationIndex, LOOKBACK_HOURS};

/// Collaborators the ingestion stage needs.
#[derive(Clone)]
pub struct IngestDeps {
    pub source: Arc<dyn ObservationSource>,
    pub store: Arc<dyn FeatureStore>,
    pub location: Location,
    pub fetch_timeout: Duration,
}

/// Outcome of ingesting a range of hours.
#[derive(Clone, Debug, Default)]
pub struct RangeReport {
    pub rows: Vec<FeatureRow>,
    pub gaps: Vec<Gap>,
    pub upsert: UpsertReport,
}

/// Totals across all batches of a backfill.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackfillReport {
    pub batches: usize,
    pub written: usize,
    pub gaps: Vec<Gap>,
    pub failed: Vec<(FeatureKey, String)>,
}

fn lookback() -> TimeDelta {
    TimeDelta::hours(LOOKBACK_HOURS)
}

/// Fetch `[start, end)` from upstream under the configured timeout.
pub fn fetch(deps: &IngestDeps, start: DateTime<Utc>, end: DateTime<Utc>) -> PipelineResult<Vec<Observation>> {
    let source = Arc::clone(&deps.source);
    let location = deps.location.clone();
    let fetched = call_with_timeout("fetch", deps.fetch_timeout, move || {
        source.fetch_observations(&location, start, end)
    })?;
    Ok(fetched?)
}

/// Archive fetched observations and index them on top of what the archive
/// already holds for the lookback.
fn index_with_archive(
    store: &dyn FeatureStore,
    location: &LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    fetched: Vec<Observation>,
) -> PipelineResult<ObservationIndex> {
    let archived = store.archive_observations(&fetched)?;
    for (key, reason) in &archived.failed {
        tracing::warn!(%key, %reason, "observation not archived");
    }
    let mut index = ObservationIndex::new(location, store.read_observations(location, start, end)?);
    for obs in fetched.into_iter().filter(|o| &o.location == location) {
        index.insert(obs);
    }
    Ok(index)
}

/// Derive a row for every hour of `[start, end)`. Incomplete hours become gaps.
fn derive_range(
    index: &ObservationIndex,
    location: &LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> PipelineResult<(Vec<FeatureRow>, Vec<Gap>)> {
    let mut rows = Vec::new();
    let mut gaps = Vec::new();
    for hour in hours(start, end) {
        match derive_row(hour, location, index) {
            Ok(row) => rows.push(row),
            Err(PipelineError::IncompleteData { missing, .. }) => gaps.push(Gap {
                timestamp: hour,
                reason: format!("missing {}", missing.join(", ")),
            }),
            Err(other) => return Err(other),
        }
    }
    Ok((rows, gaps))
}

/// Ingest the latest complete hour at or before `now`.
///
/// An hour with missing required fields is reported as
/// [`PipelineError::IncompleteData`] and nothing is written for it.
pub fn ingest_hour(deps: &IngestDeps, now: DateTime<Utc>) -> PipelineResult<FeatureRow> {
    let timer = StageTimer::start("ingest");
    let result = (|| -> PipelineResult<FeatureRow> {
        let hour = hour_floor(now);
        let fetched = fetch(deps, hour - lookback(), hour + HOUR)?;
        let index = index_with_archive(
            deps.store.as_ref(),
            &deps.location.id,
            hour - lookback(),
            hour,
            fetched,
        )?;
        let row = derive_row(hour, &deps.location.id, &index)?;
        let report = deps.store.upsert(std::slice::from_ref(&row))?;
        if let Some((key, reason)) = report.failed.into_iter().next() {
            return Err(PipelineError::Store(format!("upsert {key}: {reason}")));
        }
        Ok(row)
    })();
    match &result {
        Ok(row) => {
            tracing::info!(hour = %row.timestamp, target = ?row.target, "feature row ingested");
            timer.ok("ingest.hour");
        }
        Err(err) => timer.fail("ingest.hour", err),
    }
    result
}

/// Ingest every hour of `[start, end)`.
pub fn ingest_range(
    deps: &IngestDeps,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> PipelineResult<RangeReport> {
    let (start, end) = (hour_floor(start), hour_floor(end));
    if start >= end {
        return Ok(RangeReport::default());
    }
    let fetched = fetch(deps, start - lookback(), end)?;
    let index = index_with_archive(
        deps.store.as_ref(),
        &deps.location.id,
        start - lookback(),
        end,
        fetched,
    )?;
    let (rows, gaps) = derive_range(&index, &deps.location.id, start, end)?;
    let upsert = deps.store.upsert(&rows)?;
    Ok(RangeReport { rows, gaps, upsert })
}

/// Ingest `[start, end)` in batches of `batch_hours`.
///
/// A fetch failure aborts the remaining batches; batches already written
/// stay written, and rerunning the request resumes by overwriting them.
pub fn backfill(
    deps: &IngestDeps,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    batch_hours: u32,
) -> PipelineResult<BackfillReport> {
    if batch_hours == 0 {
        return Err(PipelineError::invalid("backfill batch size must be positive"));
    }
    let timer = StageTimer::start("backfill");
    let step = TimeDelta::hours(i64::from(batch_hours));
    let end = hour_floor(end);
    let mut cursor = hour_floor(start);
    let mut report = BackfillReport::default();

    while cursor < end {
        let batch_end = (cursor + step).min(end);
        let batch = match ingest_range(deps, cursor, batch_end) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(
                    resume_from = %cursor,
                    remaining_hours = (end - cursor).num_hours(),
                    written = report.written,
                    "backfill stopped; rerun from resume_from"
                );
                timer.fail("backfill.run", &err);
                return Err(err);
            }
        };
        tracing::info!(
            ev = "backfill.batch",
            start = %cursor,
            end = %batch_end,
            written = batch.upsert.written,
            gaps = batch.gaps.len(),
            failed = batch.upsert.failed.len(),
        );
        report.batches += 1;
        report.written += batch.upsert.written;
        report.gaps.extend(batch.gaps);
        report.failed.extend(batch.upsert.failed);
        cursor = batch_end;
    }
    timer.ok("backfill.run");
    Ok(report)
}

/// Recompute `[start, end)` from archived observations under the current
/// feature schema.
pub fn reprocess(
    store: &dyn FeatureStore,
    location: &LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> PipelineResult<RangeReport> {
    let timer = StageTimer::start("reprocess");
    let (start, end) = (hour_floor(start), hour_floor(end));
    let result = (|| -> PipelineResult<RangeReport> {
        let index = ObservationIndex::new(
            location,
            store.read_observations(location, start - lookback(), end)?,
        );
        let (rows, gaps) = derive_range(&index, location, start, end)?;
        let upsert = store.upsert(&rows)?;
        Ok(RangeReport { rows, gaps, upsert })
    })();
    match &result {
        Ok(report) => {
            tracing::info!(written = report.upsert.written, gaps = report.gaps.len(), "rows reprocessed");
            timer.ok("reprocess.run");
        }
        Err(err) => timer.fail("reprocess.run", err),
    }
    result
}

/// Hours of `[start, end)` with no row in `rows`.
pub fn missing_hours(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rows: &[FeatureRow],
) -> Vec<DateTime<Utc>> {
    let present: std::collections::BTreeSet<_> = rows.iter().map(|r| r.timestamp).collect();
    hours(start, end).filter(|h| !present.contains(h)).collect()
}
