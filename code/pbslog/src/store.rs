/// The persistent job and node tables.
///
/// There is one row per job id and one row per node name, holding the latest observation.  A job
/// that is seen again is overwritten, not appended, so the tables are not a history of state
/// transitions; trends are reconstructed from the start times of distinct jobs.
///
/// Timestamps are stored as fixed-width UTC text (see rustutils::format_timestamp) so that the
/// window filter can be done by SQLite with plain string comparison.
///
/// Writers and readers open the store differently:
///
/// - A writer takes an exclusive, non-blocking flock on `<db>.lock` before it opens the database
///   and keeps it until the Store is dropped.  If the lock is held by someone else the open fails
///   at once with LockContention; it never waits.
///
/// - A reader opens the database read-only and takes no lock.  It sees either all or none of any
///   cycle's writes, because a cycle is a single transaction.
use crate::error::{MonitorError, Result};
use crate::snapshot::{JobRecord, JobSnapshot, NodeRecord, NodeSnapshot};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use rustutils::{format_timestamp, parse_timestamp, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use ustr::Ustr;

const SCHEMA_VERSION: i64 = 1;

// How long a reader waits for a committing writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Store {
    db_path: PathBuf,
    // Declared before the lock so that the database is closed before the lock is released.
    conn: Connection,
    lock: Option<Flock<File>>,
}

impl Store {
    pub fn open_writer(db_path: impl AsRef<Path>) -> Result<Store> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| io_failure(dir, e))?;
            }
        }
        let lock = acquire_lock(&lock_path(&db_path))?;
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Store {
            db_path,
            conn,
            lock: Some(lock),
        };
        store.migrate()?;
        debug!(db = %store.db_path.display(), "store opened for writing");
        Ok(store)
    }

    pub fn open_reader(db_path: impl AsRef<Path>) -> Result<Store> {
        let db_path = db_path.as_ref().to_path_buf();
        if !db_path.is_file() {
            return Err(MonitorError::StoreUnavailable(format!(
                "No database at {}",
                db_path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Store {
            db_path,
            conn,
            lock: None,
        };
        let version = store.schema_version()?;
        if version != SCHEMA_VERSION {
            return Err(store.wrong_version(version));
        }
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
              node_name TEXT PRIMARY KEY,
              observed_at TEXT NOT NULL,
              raw_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
              job_id TEXT PRIMARY KEY,
              user TEXT NOT NULL,
              machine TEXT,
              start_time TEXT,
              observed_at TEXT NOT NULL,
              raw_data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_start_time ON jobs(start_time);
            "#,
        )?;
        let version = self.schema_version()?;
        if version == 0 {
            self.conn
                .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        } else if version != SCHEMA_VERSION {
            return Err(self.wrong_version(version));
        }
        Ok(())
    }

    fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn wrong_version(&self, version: i64) -> MonitorError {
        MonitorError::StoreUnavailable(format!(
            "{} has schema version {version}, expected {SCHEMA_VERSION}",
            self.db_path.display()
        ))
    }

    fn write_transaction(&mut self) -> Result<Transaction<'_>> {
        if self.lock.is_none() {
            return Err(MonitorError::StoreUnavailable(format!(
                "{} is open read-only",
                self.db_path.display()
            )));
        }
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Insert or overwrite every job in the batch.  Either the whole batch is committed or none of
    /// it is.  Returns the number of rows written.

    pub fn upsert_jobs(&mut self, jobs: &JobSnapshot, observed_at: Timestamp) -> Result<usize> {
        let tx = self.write_transaction()?;
        let n = upsert_jobs_in(&tx, jobs, observed_at)?;
        tx.commit()?;
        Ok(n)
    }

    pub fn upsert_nodes(&mut self, nodes: &NodeSnapshot, observed_at: Timestamp) -> Result<usize> {
        let tx = self.write_transaction()?;
        let n = upsert_nodes_in(&tx, nodes, observed_at)?;
        tx.commit()?;
        Ok(n)
    }

    /// Both tables in one transaction: a failure anywhere leaves the store as it was before.

    pub fn commit_cycle(
        &mut self,
        nodes: &NodeSnapshot,
        jobs: &JobSnapshot,
        observed_at: Timestamp,
    ) -> Result<(usize, usize)> {
        let tx = self.write_transaction()?;
        let num_nodes = upsert_nodes_in(&tx, nodes, observed_at)?;
        let num_jobs = upsert_jobs_in(&tx, jobs, observed_at)?;
        tx.commit()?;
        Ok((num_nodes, num_jobs))
    }

    /// Jobs whose start time is within [since, until], optionally only for one user and/or one
    /// machine (exact match).  Jobs without a start time are never returned.  The result is
    /// ordered by start time, then job id.

    pub fn query_jobs(
        &self,
        since: Timestamp,
        until: Timestamp,
        user: Option<&str>,
        machine: Option<&str>,
    ) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT job_id, user, machine, start_time, raw_data
            FROM jobs
            WHERE start_time IS NOT NULL
              AND start_time >= ?1 AND start_time <= ?2
              AND (?3 IS NULL OR user = ?3)
              AND (?4 IS NULL OR machine = ?4)
            ORDER BY start_time, job_id
            "#,
        )?;
        let rows = stmt
            .query_map(
                params![format_timestamp(since), format_timestamp(until), user, machine],
                read_job_columns,
            )?
            .collect::<rusqlite::Result<Vec<JobColumns>>>()?;
        rows.into_iter().map(job_from_columns).collect()
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let columns = self
            .conn
            .query_row(
                "SELECT job_id, user, machine, start_time, raw_data FROM jobs WHERE job_id = ?1",
                params![job_id],
                read_job_columns,
            )
            .optional()?;
        columns.map(job_from_columns).transpose()
    }

    pub fn get_node(&self, node_name: &str) -> Result<Option<NodeRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT node_name, raw_data FROM nodes WHERE node_name = ?1",
                params![node_name],
                |row| {
                    Ok(NodeRecord {
                        node_name: row.get(0)?,
                        raw_data: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn job_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn node_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// The earliest known start time among the jobs matching the filters, if any.

    pub fn earliest_start_time(
        &self,
        user: Option<&str>,
        machine: Option<&str>,
    ) -> Result<Option<Timestamp>> {
        let s: Option<String> = self.conn.query_row(
            r#"
            SELECT MIN(start_time) FROM jobs
            WHERE start_time IS NOT NULL
              AND (?1 IS NULL OR user = ?1)
              AND (?2 IS NULL OR machine = ?2)
            "#,
            params![user, machine],
            |row| row.get(0),
        )?;
        s.map(|s| stored_timestamp(&s)).transpose()
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn upsert_jobs_in(tx: &Transaction, jobs: &JobSnapshot, observed_at: Timestamp) -> Result<usize> {
    let mut stmt = tx.prepare_cached(
        r#"
        INSERT INTO jobs (job_id, user, machine, start_time, observed_at, raw_data)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(job_id) DO UPDATE SET
          user = excluded.user,
          machine = excluded.machine,
          start_time = excluded.start_time,
          observed_at = excluded.observed_at,
          raw_data = excluded.raw_data
        "#,
    )?;
    let observed_at = format_timestamp(observed_at);
    for job in jobs.values() {
        stmt.execute(params![
            job.job_id,
            job.user.as_str(),
            job.machine.as_ref().map(|m| m.as_str()),
            job.start_time.map(format_timestamp),
            observed_at,
            job.raw_data,
        ])?;
    }
    Ok(jobs.len())
}

fn upsert_nodes_in(tx: &Transaction, nodes: &NodeSnapshot, observed_at: Timestamp) -> Result<usize> {
    let mut stmt = tx.prepare_cached(
        r#"
        INSERT INTO nodes (node_name, observed_at, raw_data)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(node_name) DO UPDATE SET
          observed_at = excluded.observed_at,
          raw_data = excluded.raw_data
        "#,
    )?;
    let observed_at = format_timestamp(observed_at);
    for node in nodes.values() {
        stmt.execute(params![node.node_name, observed_at, node.raw_data])?;
    }
    Ok(nodes.len())
}

// (job_id, user, machine, start_time, raw_data) as stored
type JobColumns = (String, String, Option<String>, Option<String>, String);

fn read_job_columns(row: &rusqlite::Row) -> rusqlite::Result<JobColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn job_from_columns(columns: JobColumns) -> Result<JobRecord> {
    let (job_id, user, machine, start_time, raw_data) = columns;
    Ok(JobRecord {
        job_id,
        user: Ustr::from(user.as_str()),
        machine: machine.map(|m| Ustr::from(m.as_str())),
        start_time: start_time.map(|s| stored_timestamp(&s)).transpose()?,
        raw_data,
    })
}

fn stored_timestamp(s: &str) -> Result<Timestamp> {
    parse_timestamp(s).map_err(|e| MonitorError::StoreUnavailable(format!("Corrupt row: {e}")))
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn acquire_lock(lock_path: &Path) -> Result<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| io_failure(lock_path, e))?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(lock),
        Err((_, e)) if e == Errno::EWOULDBLOCK => Err(MonitorError::LockContention(
            lock_path.display().to_string(),
        )),
        Err((_, e)) => Err(MonitorError::StoreUnavailable(format!(
            "Cannot lock {}: {e}",
            lock_path.display()
        ))),
    }
}

fn io_failure(path: &Path, e: std::io::Error) -> MonitorError {
    MonitorError::StoreUnavailable(format!("{}: {e}", path.display()))
}

#[cfg(test)]
fn job(job_id: &str, user: &str, machine: Option<&str>, start: Option<Timestamp>) -> JobRecord {
    JobRecord {
        job_id: job_id.to_string(),
        user: Ustr::from(user),
        machine: machine.map(Ustr::from),
        start_time: start,
        raw_data: format!("{{\"Job_Owner\":\"{user}@login\"}}"),
    }
}

#[cfg(test)]
fn snapshot_of(jobs: Vec<JobRecord>) -> JobSnapshot {
    jobs.into_iter().map(|j| (j.job_id.clone(), j)).collect()
}

#[test]
fn test_upsert_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let t0 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 10, 0, 0);
    let jobs = snapshot_of(vec![
        job("1.srv", "jsmith", Some("compute-0-8"), Some(t0)),
        job("2.srv", "bjones", None, None),
    ]);
    let nodes = crate::normalize_nodes(r#"{"n1": {"state": "free"}, "n2": {"state": "down"}}"#)
        .unwrap();

    let mut store = Store::open_writer(&db).unwrap();
    assert!(store.commit_cycle(&nodes, &jobs, t0).unwrap() == (2, 2));
    let once = store.query_jobs(rustutils::epoch(), t0, None, None).unwrap();
    assert!(store.commit_cycle(&nodes, &jobs, t0).unwrap() == (2, 2));
    let twice = store.query_jobs(rustutils::epoch(), t0, None, None).unwrap();

    assert!(store.job_count().unwrap() == 2);
    assert!(store.node_count().unwrap() == 2);
    assert!(once == twice);
    assert!(store.get_job("2.srv").unwrap() == jobs.get("2.srv").cloned());
    assert!(store.get_node("n2").unwrap().unwrap().raw_data == "{\"state\":\"down\"}");
    assert!(store.get_node("n3").unwrap().is_none());
}

#[test]
fn test_reobserved_job_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sub").join("pbs_stats.db");
    let t1 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 10, 0, 0);
    let t2 = rustutils::timestamp_from_ymdhms(2024, 10, 14, 11, 0, 0);

    let mut store = Store::open_writer(&db).unwrap();
    store
        .upsert_jobs(&snapshot_of(vec![job("5.srv", "alice", None, None)]), t1)
        .unwrap();
    store
        .upsert_jobs(
            &snapshot_of(vec![job("5.srv", "alice", Some("compute-2-0"), Some(t2))]),
            t2,
        )
        .unwrap();

    assert!(store.job_count().unwrap() == 1);
    let j = store.get_job("5.srv").unwrap().unwrap();
    assert!(j.machine.unwrap().as_str() == "compute-2-0");
    assert!(j.start_time == Some(t2));
    let observed: String = store
        .connection()
        .query_row("SELECT observed_at FROM jobs WHERE job_id = '5.srv'", [], |r| r.get(0))
        .unwrap();
    assert!(observed == format_timestamp(t2));
}

#[test]
fn test_query_window_and_filters() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let since = rustutils::timestamp_from_ymdhms(2024, 10, 7, 12, 0, 0);
    let until = rustutils::timestamp_from_ymdhms(2024, 10, 14, 12, 0, 0);
    let before = since - chrono::Duration::seconds(1);
    let after = until + chrono::Duration::seconds(1);

    let mut store = Store::open_writer(&db).unwrap();
    store
        .upsert_jobs(
            &snapshot_of(vec![
                job("1", "alice", Some("n1"), Some(since)),
                job("2", "alice", Some("n2"), Some(until)),
                job("3", "bob", Some("n1"), Some(before)),
                job("4", "bob", Some("n1"), Some(after)),
                job("5", "bob", Some("n1"), None),
                job("6", "bob", Some("n2"), Some(since + chrono::Duration::hours(1))),
            ]),
            until,
        )
        .unwrap();

    let ids = |v: Vec<JobRecord>| v.into_iter().map(|j| j.job_id).collect::<Vec<String>>();
    assert!(ids(store.query_jobs(since, until, None, None).unwrap()) == vec!["1", "6", "2"]);
    assert!(ids(store.query_jobs(since, until, Some("alice"), None).unwrap()) == vec!["1", "2"]);
    assert!(ids(store.query_jobs(since, until, None, Some("n2")).unwrap()) == vec!["6", "2"]);
    assert!(ids(store.query_jobs(since, until, Some("bob"), Some("n2")).unwrap()) == vec!["6"]);
    assert!(store.query_jobs(since, until, Some("carol"), None).unwrap().is_empty());

    assert!(store.earliest_start_time(None, None).unwrap() == Some(before));
    assert!(store.earliest_start_time(Some("alice"), None).unwrap() == Some(since));
    assert!(store.earliest_start_time(Some("carol"), None).unwrap().is_none());
}

#[test]
fn test_failed_batch_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let t = rustutils::timestamp_from_ymdhms(2024, 10, 14, 10, 0, 0);
    let mut store = Store::open_writer(&db).unwrap();
    store
        .commit_cycle(
            &crate::normalize_nodes(r#"{"n1": {"state": "free"}}"#).unwrap(),
            &snapshot_of(vec![job("1", "alice", Some("n1"), Some(t))]),
            t,
        )
        .unwrap();

    // Make the insert of one particular job fail, after other rows of the batch went in.
    store
        .connection()
        .execute_batch(
            "CREATE TRIGGER poison BEFORE INSERT ON jobs WHEN NEW.job_id = 'zzz' \
             BEGIN SELECT RAISE(ABORT, 'poisoned'); END;",
        )
        .unwrap();

    let nodes = crate::normalize_nodes(r#"{"n1": {"state": "busy"}, "n2": {"state": "free"}}"#)
        .unwrap();
    let jobs = snapshot_of(vec![
        job("1", "alice", Some("n9"), Some(t)),
        job("2", "bob", Some("n2"), Some(t)),
        job("zzz", "mallory", Some("n2"), Some(t)),
    ]);
    match store.commit_cycle(&nodes, &jobs, t) {
        Err(MonitorError::StoreUnavailable(_)) => {}
        _ => assert!(false),
    }
    assert!(store.job_count().unwrap() == 1);
    assert!(store.node_count().unwrap() == 1);
    assert!(store.get_job("1").unwrap().unwrap().machine.unwrap().as_str() == "n1");
    assert!(store.get_node("n1").unwrap().unwrap().raw_data == "{\"state\":\"free\"}");

    // upsert_jobs alone is atomic too
    assert!(store.upsert_jobs(&jobs, t).is_err());
    assert!(store.job_count().unwrap() == 1);
}

#[test]
fn test_writer_lock() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let first = Store::open_writer(&db).unwrap();
    match Store::open_writer(&db) {
        Err(MonitorError::LockContention(path)) => assert!(path.ends_with("pbs_stats.db.lock")),
        _ => assert!(false),
    }
    // Readers are not blocked by the writer lock
    assert!(Store::open_reader(&db).unwrap().job_count().unwrap() == 0);
    drop(first);
    assert!(Store::open_writer(&db).is_ok());
}

#[test]
fn test_reader() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    match Store::open_reader(&db) {
        Err(MonitorError::StoreUnavailable(_)) => {}
        _ => assert!(false),
    }
    drop(Store::open_writer(&db).unwrap());
    let mut reader = Store::open_reader(&db).unwrap();
    let t = rustutils::now();
    match reader.upsert_jobs(&snapshot_of(vec![job("1", "alice", None, None)]), t) {
        Err(MonitorError::StoreUnavailable(_)) => {}
        _ => assert!(false),
    }
    assert!(reader.job_count().unwrap() == 0);
}

#[test]
fn test_schema_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pbs_stats.db");
    let writer = Store::open_writer(&db).unwrap();
    writer
        .connection()
        .execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION + 1))
        .unwrap();
    drop(writer);

    match Store::open_reader(&db) {
        Err(MonitorError::StoreUnavailable(msg)) => assert!(msg.contains("schema version")),
        _ => assert!(false),
    }
    match Store::open_writer(&db) {
        Err(MonitorError::StoreUnavailable(msg)) => assert!(msg.contains("schema version")),
        _ => assert!(false),
    }

    // A database file that was never set up by a writer
    let other = dir.path().join("empty.db");
    drop(rusqlite::Connection::open(&other).unwrap());
    assert!(Store::open_reader(&other).is_err());
}
