/// One collection cycle: fetch → normalize → backup → upsert.
///
/// The cycle runs to completion or fails as a whole.  It takes the store's writer lock before it
/// does anything else, so an overlapping cycle (started by the periodic trigger while a slow one
/// is still running) gives up at once with LockContention and touches nothing.  The lock is held
/// while the scheduler commands run; their timeout bounds how long that can be.
///
/// Both tables are written in one transaction, so a failed cycle leaves the store exactly as the
/// previous cycle left it.  There is no retry, the next scheduled cycle is the retry.
///
/// The raw backup is best effort: if it can't be written, that's logged and the cycle goes on.
use crate::backup::{list_backups, write_backup, BackupPair};
use crate::error::{MonitorError, Result};
use crate::scheduler::SchedulerClient;
use crate::snapshot::{normalize_jobs, normalize_nodes};
use crate::store::Store;

use chrono::{NaiveDateTime, TimeZone, Utc};
use rustutils::Timestamp;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct CycleSummary {
    pub observed_at: Timestamp,
    pub nodes: usize,
    pub jobs: usize,
    pub backup: Option<BackupPair>,
}

#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub cycles: usize,
    pub nodes: usize,
    pub jobs: usize,
}

pub fn run_cycle(
    client: &dyn SchedulerClient,
    db_path: &Path,
    backup_dir: Option<&Path>,
    observed_at: Timestamp,
) -> Result<CycleSummary> {
    let mut store = Store::open_writer(db_path)?;

    let raw_nodes = client.fetch_node_state()?;
    let raw_jobs = client.fetch_job_state()?;
    debug!(
        node_bytes = raw_nodes.len(),
        job_bytes = raw_jobs.len(),
        "fetched scheduler state"
    );

    let nodes = normalize_nodes(&raw_nodes)?;
    let jobs = normalize_jobs(&raw_jobs)?;

    let backup = match backup_dir {
        Some(dir) => match write_backup(dir, &raw_nodes, &raw_jobs, observed_at) {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!("{e}");
                None
            }
        },
        None => None,
    };

    let (num_nodes, num_jobs) = store.commit_cycle(&nodes, &jobs, observed_at)?;
    info!(
        nodes = num_nodes,
        jobs = num_jobs,
        db = %db_path.display(),
        "collection cycle complete"
    );
    Ok(CycleSummary {
        observed_at,
        nodes: num_nodes,
        jobs: num_jobs,
        backup,
    })
}

/// Re-ingest every backup pair in the directory, oldest first, each pair as one cycle observed at
/// the time recorded in its file name.  Because later observations overwrite earlier ones this
/// rebuilds the same tables the original cycles produced.  Stops at the first pair that can't be
/// read or parsed; pairs before it stay committed.

pub fn replay_backups(db_path: &Path, backup_dir: &Path) -> Result<ReplaySummary> {
    let mut store = Store::open_writer(db_path)?;
    let mut summary: ReplaySummary = Default::default();
    for pair in list_backups(backup_dir)? {
        let observed_at = stamp_time(&pair.stamp)?;
        let raw_nodes = read_backup_file(&pair.nodes)?;
        let raw_jobs = read_backup_file(&pair.jobs)?;
        let nodes = normalize_nodes(&raw_nodes)?;
        let jobs = normalize_jobs(&raw_jobs)?;
        let (n, j) = store.commit_cycle(&nodes, &jobs, observed_at)?;
        debug!(stamp = %pair.stamp, nodes = n, jobs = j, "replayed backup");
        summary.cycles += 1;
        summary.nodes += n;
        summary.jobs += j;
    }
    info!(
        cycles = summary.cycles,
        backup_dir = %backup_dir.display(),
        "replay complete"
    );
    Ok(summary)
}

fn read_backup_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| MonitorError::Backup {
        path: path.display().to_string(),
        source,
    })
}

fn stamp_time(stamp: &str) -> Result<Timestamp> {
    match NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%S%.fZ") {
        Ok(t) => Ok(Utc.from_utc_datetime(&t)),
        Err(e) => Err(MonitorError::MalformedSnapshot {
            what: "backup",
            reason: format!("bad time stamp '{stamp}': {e}"),
        }),
    }
}

#[cfg(test)]
struct FakeScheduler {
    nodes: std::result::Result<String, String>,
    jobs: std::result::Result<String, String>,
}

#[cfg(test)]
impl FakeScheduler {
    fn new(nodes: &str, jobs: &str) -> FakeScheduler {
        FakeScheduler {
            nodes: Ok(nodes.to_string()),
            jobs: Ok(jobs.to_string()),
        }
    }
}

#[cfg(test)]
impl SchedulerClient for FakeScheduler {
    fn fetch_node_state(&self) -> Result<String> {
        self.nodes.clone().map_err(|reason| MonitorError::ExternalCommand {
            command: "pbsnodes".to_string(),
            reason,
        })
    }

    fn fetch_job_state(&self) -> Result<String> {
        self.jobs.clone().map_err(|reason| MonitorError::ExternalCommand {
            command: "qstat".to_string(),
            reason,
        })
    }
}

#[test]
fn test_cycle_stores_and_backs_up() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let backups = dir.path().join("json_backups");
    let nodes = fs::read_to_string("../tests/pbslog/pbsnodes.json").unwrap();
    let jobs = fs::read_to_string("../tests/pbslog/qstat-jobs.json").unwrap();
    let t = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);

    let summary = run_cycle(&FakeScheduler::new(&nodes, &jobs), &db, Some(&backups), t).unwrap();
    assert!(summary.nodes == 3);
    assert!(summary.jobs == 4);
    let pair = summary.backup.unwrap();
    assert!(fs::read_to_string(&pair.jobs).unwrap() == jobs);
    assert!(fs::read_to_string(&pair.nodes).unwrap() == nodes);

    let store = Store::open_reader(&db).unwrap();
    assert!(store.job_count().unwrap() == 4);
    assert!(store.node_count().unwrap() == 3);
}

#[test]
fn test_job_gains_machine_in_second_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let t1 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let t2 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 13, 0, 0);
    let queued = r#"{"Jobs": {"77.pbs01": {"Job_Owner": "alice@login", "job_state": "Q"}}}"#;
    let running = r#"{"Jobs": {"77.pbs01": {"Job_Owner": "alice@login", "job_state": "R",
                      "exec_host": "compute-2-0/0*4", "stime": "2024-10-14T12:30:00Z"}}}"#;

    run_cycle(&FakeScheduler::new("{}", queued), &db, None, t1).unwrap();
    run_cycle(&FakeScheduler::new("{}", running), &db, None, t2).unwrap();

    let store = Store::open_reader(&db).unwrap();
    assert!(store.job_count().unwrap() == 1);
    let j = store.get_job("77.pbs01").unwrap().unwrap();
    assert!(j.machine.unwrap().as_str() == "compute-2-0");
}

#[test]
fn test_failed_cycle_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let backups = dir.path().join("json_backups");
    let t = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let jobs = r#"{"Jobs": {"1.s": {"Job_Owner": "a@b", "exec_host": "n1/0"}}}"#;
    run_cycle(&FakeScheduler::new(r#"{"n1": {}}"#, jobs), &db, None, t).unwrap();

    let failing = FakeScheduler {
        nodes: Ok(r#"{"n1": {}, "n2": {}}"#.to_string()),
        jobs: Err("exit status 1".to_string()),
    };
    match run_cycle(&failing, &db, Some(&backups), t) {
        Err(MonitorError::ExternalCommand { command, .. }) => assert!(command == "qstat"),
        _ => assert!(false),
    }

    match run_cycle(&FakeScheduler::new(r#"{"n3": {}}"#, "{ not json"), &db, Some(&backups), t) {
        Err(MonitorError::MalformedSnapshot { what, .. }) => assert!(what == "job"),
        _ => assert!(false),
    }

    // No backups from failed cycles, and the lock was released on the error paths
    assert!(!backups.exists());
    let store = Store::open_writer(&db).unwrap();
    assert!(store.node_count().unwrap() == 1);
    assert!(store.job_count().unwrap() == 1);
}

#[test]
fn test_overlapping_cycle_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let holder = Store::open_writer(&db).unwrap();
    let fake = FakeScheduler::new("{}", "{}");
    match run_cycle(&fake, &db, None, rustutils::now()) {
        Err(MonitorError::LockContention(_)) => {}
        _ => assert!(false),
    }
    drop(holder);
    assert!(run_cycle(&fake, &db, None, rustutils::now()).is_ok());
}

#[test]
fn test_backup_failure_does_not_fail_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, "").unwrap();
    let fake = FakeScheduler::new(r#"{"n1": {}}"#, r#"{"Jobs": {"1.s": {"Job_Owner": "a"}}}"#);
    let summary = run_cycle(&fake, &db, Some(&blocker), rustutils::now()).unwrap();
    assert!(summary.backup.is_none());
    assert!(summary.jobs == 1);
}

#[test]
fn test_replay_rebuilds_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let rebuilt = dir.path().join("rebuilt.db");
    let backups = dir.path().join("json_backups");
    let t1 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let t2 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 13, 0, 0);
    let c1 = r#"{"Jobs": {"5.s": {"Job_Owner": "a@x"}, "6.s": {"Job_Owner": "b@x"}}}"#;
    let c2 = r#"{"Jobs": {"5.s": {"Job_Owner": "a@x", "exec_host": "n7/0", "stime": "2024-10-14T12:10:00Z"}}}"#;
    run_cycle(&FakeScheduler::new(r#"{"n7": {"state": "free"}}"#, c1), &db, Some(&backups), t1)
        .unwrap();
    run_cycle(&FakeScheduler::new(r#"{"n7": {"state": "busy"}}"#, c2), &db, Some(&backups), t2)
        .unwrap();

    let summary = replay_backups(&rebuilt, &backups).unwrap();
    assert!(summary.cycles == 2);
    assert!(summary.jobs == 3);

    let original = Store::open_reader(&db).unwrap();
    let copy = Store::open_reader(&rebuilt).unwrap();
    assert!(copy.job_count().unwrap() == 2);
    assert!(original.get_job("5.s").unwrap() == copy.get_job("5.s").unwrap());
    assert!(original.get_job("6.s").unwrap() == copy.get_job("6.s").unwrap());
    assert!(copy.get_node("n7").unwrap().unwrap().raw_data.contains("busy"));
}

#[test]
fn test_stamp_time() {
    let t = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    assert!(stamp_time(&crate::backup::backup_stamp(t)).unwrap() == t);
    assert!(stamp_time("yesterday").is_err());
}
