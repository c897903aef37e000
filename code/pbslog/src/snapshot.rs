/// Turn the scheduler's JSON listings into job and node records.
///
/// NOTE:
///
/// - The listing format is whatever PBS emits and it changes between versions, so only the few
///   fields we aggregate on are decoded.  The complete per-job and per-node object is kept as
///   `raw_data` so that other fields can be derived later without re-collecting anything.
///
/// - No job is dropped for having partial fields.  A queued job has no `exec_host` and no `stime`
///   and is stored with `machine` and `start_time` empty; the next cycle fills them in.
///
/// - Object keys are kept in sorted order when re-serialized, so normalizing the same text twice
///   gives identical records.
use crate::error::{MonitorError, Result};

use itertools::Itertools;
use rustutils::{parse_scheduler_time, Timestamp};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use ustr::Ustr;

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub user: Ustr,
    pub machine: Option<Ustr>,
    pub start_time: Option<Timestamp>,
    pub raw_data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub node_name: String,
    pub raw_data: String,
}

pub type JobSnapshot = BTreeMap<String, JobRecord>;
pub type NodeSnapshot = BTreeMap<String, NodeRecord>;

impl JobRecord {
    /// Parse the stored object and extract one top-level field from it.

    pub fn raw_field(&self, key: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(&self.raw_data) {
            Ok(Value::Object(mut fields)) => fields.remove(key),
            _ => None,
        }
    }

    /// All the hosts the job was placed on, in placement order.  `machine` is the first of these.

    pub fn exec_hosts(&self) -> Vec<String> {
        match self.raw_field("exec_host") {
            Some(Value::String(s)) => parse_exec_hosts(&s),
            _ => vec![],
        }
    }
}

impl NodeRecord {
    pub fn raw_field(&self, key: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(&self.raw_data) {
            Ok(Value::Object(mut fields)) => fields.remove(key),
            _ => None,
        }
    }
}

// `exec_host` looks like "compute-0-8/0*4+compute-0-9/1*4": one host/cpu-spec chunk per vnode
// slice, and the same host can appear several times.

pub fn parse_exec_hosts(exec_host: &str) -> Vec<String> {
    exec_host
        .split('+')
        .filter_map(|chunk| chunk.split('/').next())
        .map(|host| host.trim())
        .filter(|host| !host.is_empty())
        .unique()
        .map(|host| host.to_string())
        .collect::<Vec<String>>()
}

/// `pbsnodes -av -F json` gives { "timestamp": ..., "pbs_server": ..., "nodes": { name: {...} } }.
/// A bare { name: {...} } map is accepted too.  Entries that are not objects are metadata, not
/// nodes, and are skipped.

pub fn normalize_nodes(raw_json: &str) -> Result<NodeSnapshot> {
    let fields = match parse_json(raw_json, "node")? {
        Value::Object(mut fields) => match fields.remove("nodes") {
            Some(Value::Object(nodes)) => nodes,
            Some(_) => return Err(malformed("node", "field 'nodes' must be an object")),
            None => fields,
        },
        _ => return Err(malformed("node", "expected an object")),
    };
    let mut nodes = NodeSnapshot::new();
    for (node_name, info) in fields {
        if !info.is_object() {
            debug!(key = %node_name, "skipping non-node entry in node listing");
            continue;
        }
        nodes.insert(
            node_name.clone(),
            NodeRecord {
                node_name,
                raw_data: info.to_string(),
            },
        );
    }
    Ok(nodes)
}

/// `qstat -fx -F json` gives { "timestamp": ..., "pbs_server": ..., "Jobs": { id: {...} } }, and
/// leaves out "Jobs" altogether when there are none.  A bare { id: {...} } map, or an array of
/// job objects carrying their id in `Job_Id` or `id`, is accepted too.

pub fn normalize_jobs(raw_json: &str) -> Result<JobSnapshot> {
    let mut jobs = JobSnapshot::new();
    match parse_json(raw_json, "job")? {
        Value::Object(mut fields) => {
            let entries = match fields.remove("Jobs") {
                Some(Value::Object(entries)) => entries,
                Some(_) => return Err(malformed("job", "field 'Jobs' must be an object")),
                None => fields,
            };
            for (job_id, info) in entries {
                if let Value::Object(info) = info {
                    let job = job_from_fields(job_id, info);
                    jobs.insert(job.job_id.clone(), job);
                } else {
                    debug!(key = %job_id, "skipping non-job entry in job listing");
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let Value::Object(info) = item else {
                    return Err(malformed("job", "array elements must be objects"));
                };
                let job_id = match info.get("Job_Id").or_else(|| info.get("id")) {
                    Some(Value::String(s)) if !s.is_empty() => s.clone(),
                    _ => return Err(malformed("job", "array element without a job id")),
                };
                let job = job_from_fields(job_id, info);
                jobs.insert(job.job_id.clone(), job);
            }
        }
        _ => return Err(malformed("job", "expected an object or an array")),
    }
    Ok(jobs)
}

fn job_from_fields(job_id: String, info: Map<String, Value>) -> JobRecord {
    // Job_Owner is "user@submithost"
    let user = match info.get("Job_Owner") {
        Some(Value::String(s)) => s.split('@').next().unwrap_or("").to_string(),
        _ => "".to_string(),
    };
    let machine = match info.get("exec_host") {
        Some(Value::String(s)) => parse_exec_hosts(s)
            .into_iter()
            .next()
            .map(|host| Ustr::from(host.as_str())),
        _ => None,
    };
    let stime = match info.get("stime") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "".to_string(),
    };
    let start_time = parse_scheduler_time(&stime);
    if start_time.is_none() && !stime.is_empty() {
        warn!(job = %job_id, stime = %stime, "unparseable start time, storing none");
    }
    JobRecord {
        job_id,
        user: Ustr::from(user.as_str()),
        machine,
        start_time,
        raw_data: Value::Object(info).to_string(),
    }
}

fn parse_json(raw_json: &str, what: &'static str) -> Result<Value> {
    serde_json::from_str::<Value>(raw_json).map_err(|e| malformed(what, &e.to_string()))
}

fn malformed(what: &'static str, reason: &str) -> MonitorError {
    MonitorError::MalformedSnapshot {
        what,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(format!("../tests/pbslog/{name}")).unwrap()
}

#[test]
fn test_normalize_jobs_pbs_listing() {
    let jobs = normalize_jobs(&read_fixture("qstat-jobs.json")).unwrap();
    assert!(jobs.len() == 4);

    let j = jobs.get("1001.pbs01").unwrap();
    assert!(j.job_id == "1001.pbs01");
    assert!(j.user.as_str() == "jsmith");
    assert!(j.machine.unwrap().as_str() == "compute-0-8");
    assert!(j.start_time.is_some());
    assert!(j.start_time == parse_scheduler_time("Mon Oct 14 10:22:03 2024"));
    assert!(j.exec_hosts() == vec!["compute-0-8".to_string()]);
    assert!(j.raw_field("queue") == Some(Value::String("workq".to_string())));

    // Multi-node: machine is the first host, the rest are reachable through raw_data
    let j = jobs.get("1002.pbs01").unwrap();
    assert!(j.machine.unwrap().as_str() == "compute-1-1");
    assert!(j.exec_hosts() == vec!["compute-1-1".to_string(), "compute-1-2".to_string()]);

    // Queued: no host, no start time, still stored
    let j = jobs.get("1003.pbs01").unwrap();
    assert!(j.user.as_str() == "bjones");
    assert!(j.machine.is_none());
    assert!(j.start_time.is_none());

    // Garbage start time and no owner
    let j = jobs.get("1004.pbs01").unwrap();
    assert!(j.user.as_str() == "");
    assert!(j.start_time.is_none());
    assert!(j.raw_field("stime") == Some(Value::String("sometime soon".to_string())));
}

#[test]
fn test_normalize_jobs_is_deterministic() {
    let text = read_fixture("qstat-jobs.json");
    assert!(normalize_jobs(&text).unwrap() == normalize_jobs(&text).unwrap());
}

#[test]
fn test_normalize_jobs_other_shapes() {
    // Envelope without "Jobs": nothing in the queue
    let jobs = normalize_jobs(r#"{"timestamp": 1728901323, "pbs_version": "2022.1"}"#).unwrap();
    assert!(jobs.is_empty());

    let jobs = normalize_jobs(
        r#"[{"Job_Id": "7.srv", "Job_Owner": "alice@login", "exec_host": "n1/0", "stime": "2024-10-14T10:00:00Z"},
            {"id": "8.srv", "Job_Owner": "bob"}]"#,
    )
    .unwrap();
    assert!(jobs.len() == 2);
    assert!(jobs.get("7.srv").unwrap().machine.unwrap().as_str() == "n1");
    assert!(jobs.get("8.srv").unwrap().user.as_str() == "bob");

    let jobs = normalize_jobs(r#"{"9.srv": {"Job_Owner": "carol@x", "stime": 1728901323}}"#).unwrap();
    assert!(jobs.get("9.srv").unwrap().start_time.is_some());

    // A start time that can't be stored is dropped, the job is kept
    let jobs =
        normalize_jobs(r#"{"10.srv": {"Job_Owner": "dave", "stime": 999999999999}}"#).unwrap();
    assert!(jobs.get("10.srv").unwrap().start_time.is_none());
}

#[test]
fn test_normalize_malformed() {
    for text in ["", "{", "[1, 2]", "\"jobs\"", r#"{"Jobs": []}"#, r#"[{"Job_Owner": "x"}]"#] {
        match normalize_jobs(text) {
            Err(MonitorError::MalformedSnapshot { what, .. }) => assert!(what == "job"),
            _ => assert!(false),
        }
    }
    for text in ["", "[]", r#"{"nodes": 3}"#] {
        match normalize_nodes(text) {
            Err(MonitorError::MalformedSnapshot { what, .. }) => assert!(what == "node"),
            _ => assert!(false),
        }
    }
}

#[test]
fn test_normalize_nodes() {
    let nodes = normalize_nodes(&read_fixture("pbsnodes.json")).unwrap();
    assert!(nodes.len() == 3);
    let n = nodes.get("compute-0-8").unwrap();
    assert!(n.node_name == "compute-0-8");
    assert!(n.raw_field("state") == Some(Value::String("job-busy".to_string())));

    // Bare map, metadata skipped
    let nodes = normalize_nodes(r#"{"timestamp": 5, "n1": {"state": "free"}}"#).unwrap();
    assert!(nodes.len() == 1);
    assert!(nodes.contains_key("n1"));
}

#[test]
fn test_parse_exec_hosts() {
    assert!(parse_exec_hosts("a/0*4+b/1*4+a/2") == vec!["a".to_string(), "b".to_string()]);
    assert!(parse_exec_hosts("single") == vec!["single".to_string()]);
    assert!(parse_exec_hosts("").is_empty());
}
