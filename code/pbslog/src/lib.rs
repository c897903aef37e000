/// The PBS monitor keeps a durable record of what a PBS batch system has been running.
///
/// At a fixed interval a *collection cycle* asks the scheduler for its current view of the compute
/// nodes (`pbsnodes`) and of the jobs (`qstat`), both as JSON.  Those *snapshots* are normalized
/// into one record per node and one record per job, the raw text is copied to a backup directory,
/// and the records are upserted into a SQLite store keyed on node name and job id.  A job that is
/// seen again in a later cycle replaces the earlier record, so a queued job that later starts ends
/// up with its machine and start time.
///
/// The store is written by one cycle at a time.  The writer holds an exclusive lock for the
/// duration of the cycle and an overlapping cycle fails at once instead of waiting.  Readers don't
/// take the lock.
///
/// From the store we produce *reports*: for a window of days ending now, the number of jobs each
/// user started on each machine and when the last of them started.
///
/// This library does the work; the `pbsmon` binary is the command line around it.
mod backup;
mod collect;
mod command;
mod error;
mod scheduler;
mod snapshot;
mod stats;
mod store;

// Everything that can go wrong, and the Result type that carries it.

pub use error::MonitorError;
pub use error::Result;

// Source of raw node and job state.  PbsClient runs the real PBS commands; tests substitute their
// own implementation.

pub use scheduler::SchedulerClient;
pub use scheduler::PbsClient;

// Run an external program with a time limit and capture its output.

pub use command::run_with_timeout;
pub use command::CommandFailure;

// Normalized records and snapshots (maps from identifier to record, in identifier order).

pub use snapshot::JobRecord;
pub use snapshot::JobSnapshot;
pub use snapshot::NodeRecord;
pub use snapshot::NodeSnapshot;

// Turn raw scheduler JSON into snapshots.

pub use snapshot::normalize_jobs;
pub use snapshot::normalize_nodes;

// Split a PBS exec_host string into its distinct host names, in order.

pub use snapshot::parse_exec_hosts;

// The SQLite store: writer (locked) or reader.

pub use store::Store;

// Write and enumerate raw backup pairs.

pub use backup::backup_stamp;
pub use backup::list_backups;
pub use backup::write_backup;
pub use backup::BackupPair;

// Run one collection cycle, or rebuild the store from backups.

pub use collect::replay_backups;
pub use collect::run_cycle;
pub use collect::CycleSummary;
pub use collect::ReplaySummary;

// Per-(user, machine) job statistics for a window of days.

pub use stats::generate_report;
pub use stats::Period;
pub use stats::Report;
pub use stats::ReportRow;
pub use stats::DEFAULT_DAYS;
