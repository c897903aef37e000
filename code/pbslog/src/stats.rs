/// Job statistics over a time window.
///
/// The report counts, for every (user, machine) pair, the jobs that started within the window and
/// the latest start time among them.  Rows are ordered by descending count, then by descending
/// last start, then by user and machine, so the same data always gives the same report.
///
/// Jobs that have a start time but no machine are not counted: they can't be attributed to a
/// row.  In practice these don't occur, as PBS sets `exec_host` and `stime` together.
use crate::error::{MonitorError, Result};
use crate::store::Store;

use chrono::Duration;
use rustutils::{epoch, Timestamp};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;
use ustr::Ustr;

pub const DEFAULT_DAYS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Period {
    // The last n days up to now, inclusive at both ends.
    LastDays(u32),
    // Everything in the store.
    All,
}

impl Default for Period {
    fn default() -> Self {
        Period::LastDays(DEFAULT_DAYS)
    }
}

impl FromStr for Period {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Period> {
        if s == "all" {
            Ok(Period::All)
        } else if let Ok(n) = u32::from_str(s) {
            Ok(Period::LastDays(n))
        } else {
            Err(MonitorError::ArgumentValidation(format!(
                "--days must be a non-negative integer or 'all', not '{s}'"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub user: Ustr,
    pub machine: Ustr,
    pub count: usize,
    pub last_run: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub period: Period,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub total_job_count: usize,
    pub rows: Vec<ReportRow>,
}

pub fn generate_report(
    store: &Store,
    now: Timestamp,
    period: Period,
    user: Option<&str>,
    machine: Option<&str>,
) -> Result<Report> {
    if user.is_some_and(|u| u.is_empty()) {
        return Err(MonitorError::ArgumentValidation(
            "--user must not be empty".to_string(),
        ));
    }
    if machine.is_some_and(|m| m.is_empty()) {
        return Err(MonitorError::ArgumentValidation(
            "--machine must not be empty".to_string(),
        ));
    }

    let since = match period {
        Period::LastDays(days) => now
            .checked_sub_signed(Duration::days(days as i64))
            .ok_or_else(|| {
                MonitorError::ArgumentValidation(format!("--days {days} reaches too far back"))
            })?,
        Period::All => epoch(),
    };
    let jobs = store.query_jobs(since, now, user, machine)?;
    debug!(jobs = jobs.len(), since = %since, until = %now, "jobs in window");

    let mut groups: HashMap<(Ustr, Ustr), (usize, Timestamp)> = HashMap::new();
    let mut unplaced = 0;
    for job in &jobs {
        let (Some(machine), Some(start)) = (job.machine, job.start_time) else {
            unplaced += 1;
            continue;
        };
        groups
            .entry((job.user, machine))
            .and_modify(|(count, last_run)| {
                *count += 1;
                if start > *last_run {
                    *last_run = start;
                }
            })
            .or_insert((1, start));
    }
    if unplaced > 0 {
        debug!(unplaced, "jobs without a machine were not counted");
    }

    let mut rows = groups
        .into_iter()
        .map(|((user, machine), (count, last_run))| ReportRow {
            user,
            machine,
            count,
            last_run,
        })
        .collect::<Vec<ReportRow>>();
    rows.sort_by(compare_rows);

    let window_start = match period {
        Period::LastDays(_) => since,
        Period::All => store.earliest_start_time(user, machine)?.unwrap_or(now),
    };

    Ok(Report {
        period,
        window_start,
        window_end: now,
        total_job_count: rows.iter().map(|r| r.count).sum(),
        rows,
    })
}

fn compare_rows(a: &ReportRow, b: &ReportRow) -> Ordering {
    b.count
        .cmp(&a.count)
        .then_with(|| b.last_run.cmp(&a.last_run))
        .then_with(|| a.user.as_str().cmp(b.user.as_str()))
        .then_with(|| a.machine.as_str().cmp(b.machine.as_str()))
}

#[cfg(test)]
fn store_with_jobs(
    dir: &std::path::Path,
    jobs: &[(&str, &str, Option<&str>, Option<Timestamp>)],
) -> Store {
    use crate::snapshot::{JobRecord, JobSnapshot};
    let snapshot = jobs
        .iter()
        .map(|(id, user, machine, start)| {
            (
                id.to_string(),
                JobRecord {
                    job_id: id.to_string(),
                    user: Ustr::from(*user),
                    machine: (*machine).map(Ustr::from),
                    start_time: *start,
                    raw_data: "{}".to_string(),
                },
            )
        })
        .collect::<JobSnapshot>();
    let db = dir.join("pbs_stats.db");
    let mut writer = Store::open_writer(&db).unwrap();
    writer.upsert_jobs(&snapshot, rustutils::now()).unwrap();
    drop(writer);
    Store::open_reader(&db).unwrap()
}

#[cfg(test)]
fn ago(now: Timestamp, secs: i64) -> Option<Timestamp> {
    Some(now - Duration::seconds(secs))
}

#[test]
fn test_report_two_users() {
    let now = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let day = 24 * 3600;
    let dir = tempfile::tempdir().unwrap();
    let store = store_with_jobs(
        dir.path(),
        &[
            ("1.pbs01", "jsmith", Some("compute-0-8"), ago(now, 6 * day)),
            ("2.pbs01", "jsmith", Some("compute-0-8"), ago(now, 3 * day)),
            ("3.pbs01", "jsmith", Some("compute-0-8"), ago(now, 3600)),
            ("4.pbs01", "bjones", Some("compute-1-1"), ago(now, 2 * day)),
            // Queued, never counted
            ("5.pbs01", "bjones", None, None),
        ],
    );
    let report = generate_report(&store, now, Period::LastDays(7), None, None).unwrap();
    assert!(report.total_job_count == 4);
    assert!(report.window_end == now);
    assert!(report.window_start == now - Duration::days(7));
    assert!(
        report.rows
            == vec![
                ReportRow {
                    user: Ustr::from("jsmith"),
                    machine: Ustr::from("compute-0-8"),
                    count: 3,
                    last_run: ago(now, 3600).unwrap(),
                },
                ReportRow {
                    user: Ustr::from("bjones"),
                    machine: Ustr::from("compute-1-1"),
                    count: 1,
                    last_run: ago(now, 2 * day).unwrap(),
                },
            ]
    );
}

#[test]
fn test_report_window_edges() {
    let now = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let d = 3;
    let edge = d * 24 * 3600;
    let dir = tempfile::tempdir().unwrap();
    let store = store_with_jobs(
        dir.path(),
        &[
            ("in", "alice", Some("n1"), ago(now, edge)),
            ("out", "alice", Some("n1"), ago(now, edge + 1)),
            ("future", "alice", Some("n1"), ago(now, -1)),
        ],
    );
    let report = generate_report(&store, now, Period::LastDays(d as u32), None, None).unwrap();
    assert!(report.total_job_count == 1);
    assert!(report.rows[0].last_run == ago(now, edge).unwrap());

    let all = generate_report(&store, now, Period::All, None, None).unwrap();
    assert!(all.total_job_count == 2);
    assert!(all.window_start == ago(now, edge + 1).unwrap());
}

#[test]
fn test_report_zero_days_and_empty() {
    let now = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let dir = tempfile::tempdir().unwrap();
    let store = store_with_jobs(dir.path(), &[("1", "alice", Some("n1"), ago(now, 60))]);
    let report = generate_report(&store, now, Period::LastDays(0), None, None).unwrap();
    assert!(report.total_job_count == 0);
    assert!(report.rows.is_empty());

    let report = generate_report(&store, now, Period::All, Some("nobody"), None).unwrap();
    assert!(report.total_job_count == 0);
    assert!(report.window_start == now);
}

#[test]
fn test_report_filters() {
    let now = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let dir = tempfile::tempdir().unwrap();
    let store = store_with_jobs(
        dir.path(),
        &[
            ("1", "alice", Some("n1"), ago(now, 60)),
            ("2", "alice", Some("n2"), ago(now, 120)),
            ("3", "bob", Some("n1"), ago(now, 180)),
            ("4", "alicex", Some("n1"), ago(now, 240)),
        ],
    );
    let report = generate_report(&store, now, Period::default(), Some("alice"), None).unwrap();
    assert!(report.total_job_count == 2);
    assert!(report.rows.iter().all(|r| r.user.as_str() == "alice"));

    let report = generate_report(&store, now, Period::default(), None, Some("n1")).unwrap();
    assert!(report.total_job_count == 3);
    assert!(report.rows.iter().all(|r| r.machine.as_str() == "n1"));

    let report = generate_report(&store, now, Period::default(), Some("bob"), Some("n2")).unwrap();
    assert!(report.rows.is_empty());
}

#[test]
fn test_report_ordering_is_deterministic() {
    let now = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let dir = tempfile::tempdir().unwrap();
    // Equal counts everywhere; b/n1 and a/n2 and a/n1 also tie on last run.
    let store = store_with_jobs(
        dir.path(),
        &[
            ("1", "b", Some("n1"), ago(now, 100)),
            ("2", "a", Some("n2"), ago(now, 100)),
            ("3", "a", Some("n1"), ago(now, 100)),
            ("4", "c", Some("n1"), ago(now, 10)),
        ],
    );
    let first = generate_report(&store, now, Period::default(), None, None).unwrap();
    let order = first
        .rows
        .iter()
        .map(|r| format!("{}/{}", r.user, r.machine))
        .collect::<Vec<String>>();
    assert!(order == vec!["c/n1", "a/n1", "a/n2", "b/n1"]);
    for _ in 0..5 {
        assert!(generate_report(&store, now, Period::default(), None, None).unwrap() == first);
    }
}

#[test]
fn test_argument_validation() {
    let now = rustutils::now();
    let dir = tempfile::tempdir().unwrap();
    let store = store_with_jobs(dir.path(), &[]);
    match generate_report(&store, now, Period::default(), Some(""), None) {
        Err(MonitorError::ArgumentValidation(_)) => {}
        _ => assert!(false),
    }
    match generate_report(&store, now, Period::default(), None, Some("")) {
        Err(MonitorError::ArgumentValidation(_)) => {}
        _ => assert!(false),
    }
    match generate_report(&store, now, Period::LastDays(u32::MAX), None, None) {
        Err(MonitorError::ArgumentValidation(_)) => {}
        _ => assert!(false),
    }

    assert!(Period::from_str("all").unwrap() == Period::All);
    assert!(Period::from_str("0").unwrap() == Period::LastDays(0));
    assert!(Period::from_str("14").unwrap() == Period::LastDays(14));
    assert!(Period::from_str("-1").is_err());
    assert!(Period::from_str("week").is_err());
    assert!(Period::from_str("").is_err());
}

#[test]
fn test_report_survives_absurd_start_time() {
    let now = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let jobs = crate::normalize_jobs(
        r#"{"Jobs": {
              "1.s": {"Job_Owner": "alice@x", "exec_host": "n1/0", "stime": "2024-10-14T11:00:00Z"},
              "2.s": {"Job_Owner": "alice@x", "exec_host": "n1/0", "stime": 999999999999}}}"#,
    )
    .unwrap();
    let mut writer = Store::open_writer(&db).unwrap();
    writer.upsert_jobs(&jobs, now).unwrap();
    drop(writer);

    let store = Store::open_reader(&db).unwrap();
    let all = generate_report(&store, now, Period::All, None, None).unwrap();
    assert!(all.total_job_count == 1);
    assert!(all.window_start == rustutils::timestamp_from_ymdhms(2024, 10, 14, 11, 0, 0));
    let week = generate_report(&store, now, Period::default(), None, None).unwrap();
    assert!(week.total_job_count == 1);
}
