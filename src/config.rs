//! Global Configuration (§3): the single snapshot the scheduler assembles
//! once at startup and ships verbatim to every agent, plus the `clap`
//! command-line surface both binaries parse it from.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::SystemTime;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::identity::job_identity;
use crate::spec_parser::{allocate_ephemeral_ports, parse_task_spec, TaskSpecInput};
use crate::task::TaskList;

/// Everything an agent needs to know to run its assigned task, independent of
/// which rank it ends up at. Sent once, base64-framed, right after the
/// handshake (see [`crate::protocol::ControlChannel::send_config`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalConfig {
    pub job_identity: String,
    pub tasks: TaskList,
    pub incremental: bool,
    pub force_mkdir: bool,
    pub buffer_size: usize,
    /// Addresses reducers listen on for shuffle traffic, indexed by local
    /// reducer rank (empty in map-only mode).
    pub reduce_endpoints: Vec<SocketAddr>,
    pub ssh_port: u16,
    /// Argv tail appended to the worker command line ahead of the `--mr_*`
    /// flags (see §6).
    pub worker_cmd: Vec<String>,
}

impl GlobalConfig {
    pub fn num_worker(&self) -> usize {
        self.tasks.num_worker()
    }
}

/// Command-line options shared by the scheduler binary; the agent binary only
/// needs a handful of these (host/port/rank) and parses a narrower struct in
/// `src/bin/mr_agent.rs`.
#[derive(Debug, Parser)]
#[command(name = "mr-scheduler", about = "Launch and supervise a MapReduce Lite job")]
pub struct SchedulerOptions {
    /// Local path to the worker executable, copied to every host.
    #[arg(long = "local-executable")]
    pub local_executable: PathBuf,

    /// `{hosts}:class:input_format:input_path:output_path` entries, separated
    /// by `;`. Required unless `--maponly-map-io` is given.
    #[arg(long = "map-io")]
    pub map_io: Option<String>,

    /// `{hosts}:class:input_path:output_format:output_path` entries.
    /// Required unless `--maponly-map-io` is given.
    #[arg(long = "reduce-io")]
    pub reduce_io: Option<String>,

    /// `{hosts}:class:input_format:input_path:output_format:output_path`
    /// entries. Mutually exclusive with `--map-io`/`--reduce-io`.
    #[arg(long = "maponly-map-io")]
    pub maponly_map_io: Option<String>,

    /// `{hosts}path` entries mapping each host to its scratch directory.
    #[arg(long = "tmp-dir")]
    pub tmp_dir: String,

    /// `{hosts}path` entries mapping each host to its log file base path.
    #[arg(long = "log-filebase")]
    pub log_filebase: String,

    #[arg(long = "buffer-size", default_value_t = 1024)]
    pub buffer_size: usize,

    #[arg(long = "incremental", default_value_t = false)]
    pub incremental: bool,

    #[arg(long = "force-mkdir", default_value_t = false)]
    pub force_mkdir: bool,

    #[arg(long = "ssh-port", default_value_t = 22)]
    pub ssh_port: u16,

    /// Argv tail passed through to the worker binary on every host.
    #[arg(long = "worker-cmd", num_args = 0.., value_delimiter = ' ')]
    pub worker_cmd: Vec<String>,

    /// User identity used both for SSH logins and the job identity string;
    /// defaults to the invoking user.
    #[arg(long = "user")]
    pub user: Option<String>,

    /// Path to the agent binary, copied alongside the worker executable to
    /// every host. Defaults to `mr-agent` next to this binary.
    #[arg(long = "agent-binary")]
    pub agent_binary: Option<PathBuf>,
}

impl SchedulerOptions {
    /// Parses the task spec and probes ephemeral reduce ports, producing a
    /// complete [`GlobalConfig`] ready to be shipped to agents. Each
    /// reducer's endpoint pairs its resolved host with a port number probed
    /// locally, the same trick `allocate_ephemeral_ports` documents.
    pub fn into_global_config(self, user: &str, now: SystemTime) -> Result<GlobalConfig, SpecError> {
        let tasks = parse_task_spec(TaskSpecInput {
            map_io: self.map_io.as_deref(),
            reduce_io: self.reduce_io.as_deref(),
            maponly_map_io: self.maponly_map_io.as_deref(),
            tmp_dir_spec: &self.tmp_dir,
            log_filebase_spec: &self.log_filebase,
            local_executable: &self.local_executable,
        })?;

        let reduce_endpoints = if tasks.map_only {
            Vec::new()
        } else {
            let ports = allocate_ephemeral_ports(tasks.num_reduce_worker)?;
            tasks
                .reducer_ranks()
                .zip(ports)
                .map(|(rank, port)| -> Result<SocketAddr, SpecError> {
                    let ip = tasks.task(rank).host.parse()?;
                    Ok(SocketAddr::new(ip, port))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(GlobalConfig {
            job_identity: job_identity(&self.local_executable, user, now),
            tasks,
            incremental: self.incremental,
            force_mkdir: self.force_mkdir,
            buffer_size: self.buffer_size,
            reduce_endpoints,
            ssh_port: self.ssh_port,
            worker_cmd: self.worker_cmd,
        })
    }
}

/// Command-line options for the agent binary: just enough to dial the
/// scheduler and hand off the rest of the handshake.
#[derive(Debug, Parser)]
#[command(name = "mr-agent", about = "MapReduce Lite per-host agent")]
pub struct AgentOptions {
    /// Scheduler control-channel address, `host:port`.
    #[arg(long = "scheduler-addr")]
    pub scheduler_addr: SocketAddr,

    /// This agent's rank, assigned by the scheduler at launch time. The
    /// agent announces it in the handshake rather than waiting to be told.
    #[arg(long = "rank")]
    pub rank: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_minimal_scheduler_options() {
        let opts = SchedulerOptions::parse_from([
            "mr-scheduler",
            "--local-executable",
            "/opt/bin/wordcount",
            "--map-io",
            "{10.0.0.1}:M:text:/in/*:/out",
            "--reduce-io",
            "{10.0.0.1}:R:/out:text:/final",
            "--tmp-dir",
            "{10.0.0.1}/tmp",
            "--log-filebase",
            "{10.0.0.1}/tmp/log",
        ]);
        assert_eq!(opts.buffer_size, 1024);
        assert_eq!(opts.ssh_port, 22);
        assert!(!opts.incremental);
    }

    #[test]
    fn parses_agent_options() {
        let opts = AgentOptions::parse_from([
            "mr-agent",
            "--scheduler-addr",
            "10.0.0.5:9000",
            "--rank",
            "2",
        ]);
        assert_eq!(opts.scheduler_addr.port(), 9000);
        assert_eq!(opts.rank, 2);
    }

    #[test]
    fn builds_global_config_with_one_endpoint_per_reducer() {
        use std::io::Write;
        let mut exe = tempfile::NamedTempFile::new().unwrap();
        exe.write_all(b"#!/bin/sh\n").unwrap();

        let opts = SchedulerOptions::parse_from([
            "mr-scheduler",
            "--local-executable",
            exe.path().to_str().unwrap(),
            "--map-io",
            "{10.0.0.1,10.0.0.2}:M:text:/in/*:/out",
            "--reduce-io",
            "{10.0.0.1}:R:/out:text:/final",
            "--tmp-dir",
            "{10.0.0.1,10.0.0.2}/tmp",
            "--log-filebase",
            "{10.0.0.1,10.0.0.2}/tmp/log",
        ]);
        let config = opts
            .into_global_config("alice", std::time::UNIX_EPOCH)
            .unwrap();
        assert_eq!(config.reduce_endpoints.len(), 1);
        assert_eq!(config.reduce_endpoints[0].ip().to_string(), "10.0.0.1");
        assert!(config.job_identity.contains("alice"));
    }
}
