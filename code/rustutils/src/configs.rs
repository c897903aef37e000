/// Read monitor settings from a json file.
///
/// File format:
///
/// An object { ... } with the following named fields and value types, all optional:
///
///   db-path - string, the sqlite database holding the job and node tables
///   backup-dir - string, directory that receives the raw json snapshot files
///   pbsnodes - string, path of the `pbsnodes` executable
///   qstat - string, path of the `qstat` executable
///   command-timeout - integer, seconds a scheduler command may run before it is killed
///
/// Any field name starting with '#' is reserved for arbitrary comments.  Any other unknown field is
/// an error, so that typos don't silently leave a default in place.
use anyhow::{bail, Result};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path;

pub const DEFAULT_DB_PATH: &str = "/var/lib/pbs_monitor/pbs_stats.db";
pub const DEFAULT_BACKUP_DIR: &str = "/var/log/pbs_monitor/json_backups";
pub const DEFAULT_PBSNODES: &str = "/opt/pbs/bin/pbsnodes";
pub const DEFAULT_QSTAT: &str = "/opt/pbs/bin/qstat";
pub const DEFAULT_COMMAND_TIMEOUT: u64 = 300;

// See above comment block for field documentation.

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub db_path: String,
    pub backup_dir: String,
    pub pbsnodes: String,
    pub qstat: String,
    pub command_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            db_path: DEFAULT_DB_PATH.to_string(),
            backup_dir: DEFAULT_BACKUP_DIR.to_string(),
            pbsnodes: DEFAULT_PBSNODES.to_string(),
            qstat: DEFAULT_QSTAT.to_string(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// The file is edited by hand on the cluster's admin node, so as with the cluster configs I've
/// opted to use the generic JSON parser followed by explicit decoding of the fields.

pub fn read_monitor_config(filename: &str) -> Result<MonitorConfig> {
    let file = File::open(path::Path::new(filename))?;
    let reader = BufReader::new(file);
    let v = serde_json::from_reader(reader)?;
    let mut cfg: MonitorConfig = Default::default();
    if let Value::Object(fields) = v {
        for k in fields.keys() {
            match k.as_str() {
                "db-path" | "backup-dir" | "pbsnodes" | "qstat" | "command-timeout" => {}
                _ if k.starts_with('#') => {}
                _ => bail!("Unknown field '{k}' in {filename}"),
            }
        }
        if let Some(s) = grab_string_opt(&fields, "db-path")? {
            cfg.db_path = s;
        }
        if let Some(s) = grab_string_opt(&fields, "backup-dir")? {
            cfg.backup_dir = s;
        }
        if let Some(s) = grab_string_opt(&fields, "pbsnodes")? {
            cfg.pbsnodes = s;
        }
        if let Some(s) = grab_string_opt(&fields, "qstat")? {
            cfg.qstat = s;
        }
        if let Some(n) = grab_u64_opt(&fields, "command-timeout")? {
            if n == 0 {
                bail!("Field 'command-timeout' must be positive");
            }
            cfg.command_timeout_secs = n;
        }
    } else {
        bail!("Expected an object value")
    }
    Ok(cfg)
}

fn grab_string_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<String>> {
    match fields.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.to_string())),
        Some(_) => bail!("Field '{name}' must have a nonempty string value"),
        None => Ok(None),
    }
}

fn grab_u64_opt(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<u64>> {
    match fields.get(name) {
        Some(Value::Number(n)) => {
            if let Some(n) = n.as_u64() {
                Ok(Some(n))
            } else {
                bail!("Field '{name}' must have unsigned integer value")
            }
        }
        Some(_) => bail!("Field '{name}' must have unsigned integer value"),
        None => Ok(None),
    }
}

#[cfg(test)]
fn write_config(text: &str) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(text.as_bytes()).unwrap();
    f
}

#[test]
fn test_config() {
    let conf = read_monitor_config("../tests/pbslog/monitor-config.json").unwrap();
    assert!(conf.db_path == "/srv/pbsmon/pbs_stats.db");
    assert!(conf.backup_dir == "/srv/pbsmon/backups");
    assert!(conf.qstat == "/usr/local/pbs/bin/qstat");
    // Not mentioned in the file
    assert!(conf.pbsnodes == DEFAULT_PBSNODES);
    assert!(conf.command_timeout_secs == 120);
}

#[test]
fn test_config_empty_object_is_defaults() {
    let f = write_config(r##"{"#comment": "nothing to see"}"##);
    let conf = read_monitor_config(f.path().to_str().unwrap()).unwrap();
    assert!(conf == MonitorConfig::default());
}

#[test]
fn test_config_errors() {
    let f = write_config(r#"{"db-path": 17}"#);
    assert!(read_monitor_config(f.path().to_str().unwrap()).is_err());

    let f = write_config(r#"{"command-timeout": -1}"#);
    assert!(read_monitor_config(f.path().to_str().unwrap()).is_err());

    let f = write_config(r#"{"command-timeout": 0}"#);
    assert!(read_monitor_config(f.path().to_str().unwrap()).is_err());

    let f = write_config(r#"{"dbpath": "/tmp/x.db"}"#);
    assert!(read_monitor_config(f.path().to_str().unwrap()).is_err());

    let f = write_config(r#"["db-path"]"#);
    assert!(read_monitor_config(f.path().to_str().unwrap()).is_err());

    assert!(read_monitor_config("../tests/pbslog/no-such-file.json").is_err());
}
