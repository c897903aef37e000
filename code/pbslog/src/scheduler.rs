// Talk to the batch scheduler.  The only thing we need from it is the JSON text of the full node
// listing and the full job listing; what is in there is the normalizer's business.

use crate::command::run_with_timeout;
use crate::error::{MonitorError, Result};

use rustutils::MonitorConfig;
use tracing::debug;

pub trait SchedulerClient {
    fn fetch_node_state(&self) -> Result<String>;
    fn fetch_job_state(&self) -> Result<String>;
}

/// The PBS Pro / OpenPBS introspection commands.

pub struct PbsClient {
    pbsnodes: String,
    qstat: String,
    timeout_secs: u64,
}

impl PbsClient {
    pub fn new(config: &MonitorConfig) -> PbsClient {
        PbsClient {
            pbsnodes: config.pbsnodes.clone(),
            qstat: config.qstat.clone(),
            timeout_secs: config.command_timeout_secs,
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, timeout = self.timeout_secs, "running scheduler command");
        run_with_timeout(program, args, self.timeout_secs).map_err(|failure| {
            MonitorError::ExternalCommand {
                command: format!("{} {}", program, args.join(" ")),
                reason: failure.to_string(),
            }
        })
    }
}

impl SchedulerClient for PbsClient {
    fn fetch_node_state(&self) -> Result<String> {
        self.run(&self.pbsnodes, &["-av", "-F", "json"])
    }

    // -x includes finished jobs that the server still remembers, which is what makes short jobs
    // between two cycles visible at all.
    fn fetch_job_state(&self) -> Result<String> {
        self.run(&self.qstat, &["-fx", "-F", "json"])
    }
}

#[test]
fn test_pbs_client_runs_configured_programs() {
    // Stand-ins for the real binaries: `echo` just prints its arguments back.
    let config = MonitorConfig {
        pbsnodes: "echo".to_string(),
        qstat: "echo".to_string(),
        command_timeout_secs: 10,
        ..Default::default()
    };
    let client = PbsClient::new(&config);
    assert!(client.fetch_node_state().unwrap().trim() == "-av -F json");
    assert!(client.fetch_job_state().unwrap().trim() == "-fx -F json");
}

#[test]
fn test_pbs_client_missing_binary() {
    let config = MonitorConfig {
        pbsnodes: "/no/such/dir/pbsnodes".to_string(),
        ..Default::default()
    };
    let client = PbsClient::new(&config);
    match client.fetch_node_state() {
        Err(MonitorError::ExternalCommand { command, .. }) => {
            assert!(command == "/no/such/dir/pbsnodes -av -F json");
        }
        _ => assert!(false),
    }
}
