//! Shared fixtures: a fake service answering the bootstrap protocol on mock
//! machines, and pool construction over the in-memory infra server.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hostpool_harness::{HarnessConfig, HostPool, KeepPolicy, PollSettings, Topology};
use hostpool_infra::MockInfra;
use hostpool_remote::mock::{MockConnector, MockMachine};
use hostpool_remote::CommandOutput;

const POLL_COUNTER: &str = "/var/lib/fake/probe_count";
const CERT_DIR: &str = "/etc/hostpool/ssl/";

/// How the fake service behaves on each host.
#[derive(Debug, Clone, Default)]
pub struct FakeService {
    /// Probes answered `running` before the job finishes.
    pub polls_to_finish: u32,
    /// Hosts whose bootstrap job fails.
    pub failing: HashSet<String>,
    /// Hosts whose job leaves both sentinels behind.
    pub conflicting: HashSet<String>,
    /// Hosts whose services report stopped after setup.
    pub unhealthy: HashSet<String>,
}

impl FakeService {
    pub fn failing(host: &str) -> Self {
        Self {
            failing: HashSet::from([host.to_string()]),
            ..Self::default()
        }
    }

    pub fn connector(self) -> Arc<MockConnector> {
        Arc::new(MockConnector::auto_provision(move |machine, command| {
            self.handle(machine, command)
        }))
    }

    /// A single machine running the fake service.
    pub fn machine(self) -> Arc<MockMachine> {
        MockMachine::with_handler(move |machine, command| self.handle(machine, command))
    }

    fn handle(&self, machine: &MockMachine, command: &str) -> CommandOutput {
        if command.contains("nohup") {
            return self.launch(machine);
        }
        if command.contains("echo not-started") {
            return self.probe(machine);
        }
        if command.contains("svcctl status") {
            return self.status(machine);
        }
        if command.contains("test -e") {
            // Setup is finished once the job completed.
            return match job_prefix(machine) {
                Some(job) if machine.has_file(&format!("{job}_complete")) => CommandOutput::ok(""),
                _ => CommandOutput::failed(1, ""),
            };
        }
        if command.contains("tail -n") {
            let log = job_prefix(machine)
                .and_then(|job| machine.file(&format!("{job}.log")))
                .unwrap_or_default();
            return CommandOutput::ok(log);
        }
        if command.contains("rm -rf") {
            return cleanup(machine);
        }
        if let Some(output) = move_file(machine, command) {
            return output;
        }
        CommandOutput::ok("")
    }

    fn launch(&self, machine: &MockMachine) -> CommandOutput {
        let Some(job) = job_prefix(machine) else {
            return CommandOutput::failed(1, "bootstrap document missing");
        };
        machine.remove_file(&format!("{job}_complete"));
        machine.remove_file(&format!("{job}_failed"));
        machine.write_file(&format!("{job}.log"), "installing\n");
        machine.write_file(POLL_COUNTER, "0");
        CommandOutput::ok("")
    }

    fn probe(&self, machine: &MockMachine) -> CommandOutput {
        let Some(job) = job_prefix(machine) else {
            return CommandOutput::ok("not-started\n");
        };
        let complete = format!("{job}_complete");
        let failed = format!("{job}_failed");
        let log = format!("{job}.log");

        let finished = machine.has_file(&complete) || machine.has_file(&failed);
        if machine.has_file(&log) && !finished {
            let polls = machine
                .file(POLL_COUNTER)
                .and_then(|n| n.parse::<u32>().ok())
                .unwrap_or(0)
                + 1;
            machine.write_file(POLL_COUNTER, polls.to_string());

            if polls > self.polls_to_finish {
                let host = host_name(&job);
                if self.failing.contains(&host) {
                    machine.write_file(&log, "installing\nerror: database quorum unreachable\n");
                    machine.write_file(&failed, "");
                } else if self.conflicting.contains(&host) {
                    machine.write_file(&complete, "");
                    machine.write_file(&failed, "");
                } else {
                    machine.write_file(&complete, "");
                }
            }
        }

        let state = if machine.has_file(&failed) {
            "failed"
        } else if machine.has_file(&complete) {
            "complete"
        } else if machine.has_file(&log) {
            "running"
        } else {
            "not-started"
        };
        CommandOutput::ok(format!("{state}\n"))
    }

    fn status(&self, machine: &MockMachine) -> CommandOutput {
        let unhealthy = job_prefix(machine)
            .map(|job| self.unhealthy.contains(&host_name(&job)))
            .unwrap_or(false);
        let api = if unhealthy { "stopped" } else { "running" };
        CommandOutput::ok(status_json(&[
            ("api", api),
            ("cluster", "running"),
            ("queue", "running"),
            ("postgres", "running"),
        ]))
    }
}

/// Output of the service status command reporting `services`.
pub fn status_json(services: &[(&str, &str)]) -> String {
    let services: serde_json::Map<String, serde_json::Value> = services
        .iter()
        .map(|(name, status)| (name.to_string(), serde_json::json!({ "status": status })))
        .collect();
    serde_json::json!({ "services": services }).to_string()
}

/// `/tmp/<host>_bootstrap`, found through the uploaded bootstrap document.
pub fn job_prefix(machine: &MockMachine) -> Option<String> {
    machine
        .files()
        .into_iter()
        .find_map(|path| path.strip_suffix("_config.json").map(str::to_string))
}

fn host_name(job: &str) -> String {
    job.trim_start_matches("/tmp/")
        .trim_end_matches("_bootstrap")
        .to_string()
}

fn cleanup(machine: &MockMachine) -> CommandOutput {
    let job = job_prefix(machine);
    for path in machine.files() {
        let job_file = job.as_deref().is_some_and(|job| path.starts_with(job));
        if path.starts_with(CERT_DIR) || job_file {
            machine.remove_file(&path);
        }
    }
    CommandOutput::ok("")
}

/// Perform `mv SRC DST` as issued by elevated file writes.
fn move_file(machine: &MockMachine, command: &str) -> Option<CommandOutput> {
    let start = command.find("mv ")?;
    let mut args = command[start + 3..]
        .split_whitespace()
        .map(|arg| arg.trim_matches('\''));
    let (src, dst) = (args.next()?, args.next()?);

    let Some(contents) = machine.file(src) else {
        return Some(CommandOutput::failed(1, format!("mv: cannot stat '{src}'")));
    };
    machine.remove_file(src);
    machine.write_file(dst, contents);
    Some(CommandOutput::ok(""))
}

/// Fast polling so tests finish in milliseconds.
pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        poll: PollSettings::uniform(20, Duration::from_millis(1)),
        keep: KeepPolicy::Never,
        ..HarnessConfig::default()
    }
}

pub struct Fixture {
    pub infra: Arc<MockInfra>,
    pub connector: Arc<MockConnector>,
    pub pool: HostPool,
}

impl Fixture {
    pub fn new(topology: Topology, service: FakeService) -> Self {
        Self::with(topology, service, MockInfra::new(), test_config())
    }

    pub fn with(
        topology: Topology,
        service: FakeService,
        infra: MockInfra,
        config: HarnessConfig,
    ) -> Self {
        let infra = Arc::new(infra);
        let connector = service.connector();
        let pool = HostPool::new("it-run", &topology, &config, infra.clone(), connector.clone())
            .expect("valid topology");
        Self {
            infra,
            connector,
            pool,
        }
    }

    /// The mock machine behind a provisioned host.
    pub fn machine(&self, host: &str) -> Arc<MockMachine> {
        let address = self
            .pool
            .host(host)
            .and_then(|h| h.ip_address().ok())
            .expect("host has an address");
        self.connector.machine(address).expect("machine connected")
    }
}
