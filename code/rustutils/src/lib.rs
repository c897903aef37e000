// Misc utilities useful to both pbslog and pbsmon.

mod configs;
mod dates;

// Settings for the monitor: where the database and backups live, which scheduler commands to run.

pub use configs::MonitorConfig;

// Read monitor settings from a JSON file, layered over the defaults.

pub use configs::read_monitor_config;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// "A long long time ago".

pub use dates::epoch;

// The time right now, to the second.

pub use dates::now;

// Parse a stored (fixed-width ISO 8601 UTC) timestamp.

pub use dates::parse_timestamp;

// Parse a start time as the scheduler reports it.  Returns None if it can't be made sense of.

pub use dates::parse_scheduler_time;

// Render a Timestamp in the stored form, which sorts lexically in time order.

pub use dates::format_timestamp;

// Render a Timestamp as YYYY-MM-DD.

pub use dates::format_date;

// Given year, month, day, hour, minute, second (all UTC), return a Timestamp.

pub use dates::timestamp_from_ymdhms;
