// Raw snapshot backups.
//
// Every cycle writes the untouched scheduler output to a pair of files in the backup directory:
//
//   nodes_<stamp>.json
//   jobs_<stamp>.json
//
// where <stamp> is the cycle time as yyyymmddTHHMMSS.ffffffZ (UTC), fixed width, so that a plain
// sort of the file names is a sort by time.  Files are created with create-new semantics and a
// backup is never overwritten.
//
// The backups are for disaster recovery: `replay` (see collect.rs) re-ingests them in order.

use crate::error::{MonitorError, Result};

use rustutils::Timestamp;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const NODES_PREFIX: &str = "nodes_";
const JOBS_PREFIX: &str = "jobs_";
const SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq)]
pub struct BackupPair {
    pub stamp: String,
    pub nodes: PathBuf,
    pub jobs: PathBuf,
}

pub fn backup_stamp(t: Timestamp) -> String {
    t.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

pub fn write_backup(
    backup_dir: &Path,
    raw_node_json: &str,
    raw_job_json: &str,
    timestamp: Timestamp,
) -> Result<BackupPair> {
    fs::create_dir_all(backup_dir).map_err(|e| backup_failure(backup_dir, e))?;
    let stamp = backup_stamp(timestamp);
    let nodes = backup_dir.join(format!("{NODES_PREFIX}{stamp}{SUFFIX}"));
    let jobs = backup_dir.join(format!("{JOBS_PREFIX}{stamp}{SUFFIX}"));
    write_new_file(&nodes, raw_node_json)?;
    write_new_file(&jobs, raw_job_json)?;
    Ok(BackupPair { stamp, nodes, jobs })
}

fn write_new_file(path: &Path, contents: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| backup_failure(path, e))?;
    f.write_all(contents.as_bytes())
        .and_then(|_| f.sync_all())
        .map_err(|e| backup_failure(path, e))
}

fn backup_failure(path: &Path, source: std::io::Error) -> MonitorError {
    MonitorError::Backup {
        path: path.display().to_string(),
        source,
    }
}

/// All complete backup pairs in the directory, oldest first.  A nodes file without its jobs file
/// (or vice versa) is ignored; that's what a backup cut short by a full disk looks like.

pub fn list_backups(backup_dir: &Path) -> Result<Vec<BackupPair>> {
    let entries = fs::read_dir(backup_dir).map_err(|e| backup_failure(backup_dir, e))?;
    let mut stamps = vec![];
    for entry in entries {
        let entry = entry.map_err(|e| backup_failure(backup_dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(stamp) = name
            .strip_prefix(NODES_PREFIX)
            .and_then(|rest| rest.strip_suffix(SUFFIX))
        {
            stamps.push(stamp.to_string());
        }
    }
    stamps.sort();
    Ok(stamps
        .into_iter()
        .map(|stamp| BackupPair {
            nodes: backup_dir.join(format!("{NODES_PREFIX}{stamp}{SUFFIX}")),
            jobs: backup_dir.join(format!("{JOBS_PREFIX}{stamp}{SUFFIX}")),
            stamp,
        })
        .filter(|pair| pair.jobs.is_file())
        .collect::<Vec<BackupPair>>())
}

#[test]
fn test_backup_names_sort_by_time() {
    let a = rustutils::timestamp_from_ymdhms(2024, 9, 30, 23, 0, 0);
    let b = rustutils::timestamp_from_ymdhms(2024, 10, 1, 0, 0, 0);
    let c = b + chrono::Duration::microseconds(1500);
    assert!(backup_stamp(a) == "20240930T230000.000000Z");
    assert!(backup_stamp(a) < backup_stamp(b));
    assert!(backup_stamp(b) < backup_stamp(c));
    assert!(backup_stamp(b).len() == backup_stamp(c).len());
}

#[test]
fn test_write_and_list_backups() {
    let dir = tempfile::tempdir().unwrap();
    let backups = dir.path().join("json_backups");
    let t1 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 11, 0, 0);
    let t0 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 10, 0, 0);

    let p1 = write_backup(&backups, "{\"n\":1}", "{\"j\":1}", t1).unwrap();
    let p0 = write_backup(&backups, "{\"n\":0}", "{\"j\":0}", t0).unwrap();
    assert!(fs::read_to_string(&p1.nodes).unwrap() == "{\"n\":1}");
    assert!(fs::read_to_string(&p1.jobs).unwrap() == "{\"j\":1}");

    // Never overwritten
    match write_backup(&backups, "x", "y", t1) {
        Err(MonitorError::Backup { .. }) => {}
        _ => assert!(false),
    }
    assert!(fs::read_to_string(&p1.nodes).unwrap() == "{\"n\":1}");

    // A lone half of a pair is skipped
    fs::write(backups.join("nodes_20240101T000000.000000Z.json"), "{}").unwrap();
    fs::write(backups.join("README"), "not a backup").unwrap();

    let listed = list_backups(&backups).unwrap();
    assert!(listed == vec![p0, p1]);
}

#[test]
fn test_backup_dir_unwritable() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, "").unwrap();
    // A path below a regular file can't be created
    match write_backup(&blocker.join("backups"), "{}", "{}", rustutils::now()) {
        Err(MonitorError::Backup { .. }) => {}
        _ => assert!(false),
    }
    assert!(list_backups(&dir.path().join("missing")).is_err());
}
