//! Hour arithmetic and bounded external calls.
//!
//! Business logic never reads the wall clock; callers pass the tick time in.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use super::error::{PipelineError, PipelineResult};

/// One hour, the feature store's native resolution.
pub const HOUR: TimeDelta = TimeDelta::hours(1);

/// Truncate a timestamp to the start of its UTC hour.
pub fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    // duration_trunc only fails for out-of-range timestamps
    ts.duration_trunc(HOUR).unwrap_or(ts)
}

/// Whether `ts` sits exactly on an hour boundary.
pub fn is_hour_aligned(ts: DateTime<Utc>) -> bool {
    hour_floor(ts) == ts
}

/// Every hour in the half-open range `[start, end)`, both ends floored.
pub fn hours(start: DateTime<Utc>, end: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> {
    let end = hour_floor(end);
    let mut next = hour_floor(start);
    std::iter::from_fn(move || {
        if next >= end {
            return None;
        }
        let out = next;
        next += HOUR;
        Some(out)
    })
}

/// Number of whole hours between two aligned timestamps.
pub fn hour_count(start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
    (hour_floor(end) - hour_floor(start)).num_hours().max(0) as usize
}

/// Run `job` on a helper thread and wait at most `limit` for it.
///
/// On timeout the helper thread is detached; jobs handed here must be
/// side-effect free (reads or fetches), never store writes.
pub fn call_with_timeout<T, F>(operation: &'static str, limit: Duration, job: F) -> PipelineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name(format!("aqi-{operation}"))
        .spawn(move || {
            let _ = tx.send(job());
        })
        .map_err(|e| PipelineError::Store(format!("spawn {operation}: {e}")))?;

    rx.recv_timeout(limit).map_err(|err| match err {
        mpsc::RecvTimeoutError::Timeout => PipelineError::Timeout {
            operation,
            after: Some(limit),
        },
        mpsc::RecvTimeoutError::Disconnected => {
            PipelineError::Store(format!("{operation} worker exited without a result"))
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn floors_to_the_hour() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 13, 47, 12).unwrap();
        assert_eq!(
            hour_floor(ts),
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap()
        );
        assert!(!is_hour_aligned(ts));
        assert!(is_hour_aligned(hour_floor(ts)));
    }

    #[test]
    fn hour_range_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap();
        let all: Vec<_> = hours(start, end).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], start);
        assert_eq!(hour_count(start, end), 3);
        assert_eq!(hours(end, start).count(), 0);
    }

    #[test]
    fn slow_calls_time_out() {
        let err = call_with_timeout("sleepy", Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(500));
            1
        })
        .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { operation: "sleepy", .. }));

        let ok = call_with_timeout("quick", Duration::from_secs(1), || 7).unwrap();
        assert_eq!(ok, 7);
    }
}
