//! Scheduler binary: parses the job spec, deploys, launches agents, drives
//! the job to completion or aborts and kills everything it started.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, SystemTime};

use clap::Parser;
use log::{error, info, warn};

use mrlite::config::SchedulerOptions;
use mrlite::remote_exec::SystemRemoteExec;
use mrlite::scheduler::Scheduler;
use mrlite::task::TaskList;

const MONITOR_TICK: Duration = Duration::from_secs(5);

fn default_agent_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("mr-agent")))
        .unwrap_or_else(|| PathBuf::from("mr-agent"))
}

/// Picks the address the scheduler should advertise to remotely-launched
/// agents, so they have something routable to dial back to instead of
/// whatever `0.0.0.0` would report. Connects a throwaway UDP socket to one of
/// the job's own hosts and reads back which local interface the kernel would
/// route through, the same trick the original reaches for `gethostbyname`
/// to approximate, without requiring a DNS-resolvable hostname.
fn scheduler_advertise_ip(tasks: &TaskList) -> IpAddr {
    let probe = tasks
        .tasks
        .iter()
        .map(|t| t.host.as_str())
        .find(|h| *h != "127.0.0.1");

    probe
        .and_then(|host| {
            let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
            socket.connect((host, 9)).ok()?;
            socket.local_addr().ok().map(|a| a.ip())
        })
        .unwrap_or_else(|| {
            warn!("could not determine a routable local address, falling back to 127.0.0.1");
            IpAddr::from([127, 0, 0, 1])
        })
}

fn run() -> Result<(), mrlite::error::SchedulerError> {
    let opts = SchedulerOptions::parse();
    let ssh_port = opts.ssh_port;
    let local_executable = opts.local_executable.clone();
    let agent_binary = opts.agent_binary.clone().unwrap_or_else(default_agent_binary);
    let user = opts.user.clone().unwrap_or_else(whoami::username);

    let config = opts.into_global_config(&user, SystemTime::now())?;
    let mode = if config.tasks.map_only {
        "MAP-ONLY"
    } else if config.incremental {
        "INCREMENTAL"
    } else {
        "BATCH"
    };
    info!("Mapreduce-Lite begin to work in {mode} mode, job {}", config.job_identity);

    let exec = SystemRemoteExec::new(ssh_port);
    let mut scheduler = Scheduler::new(config, &exec);

    let result = (|| -> Result<(), mrlite::error::SchedulerError> {
        scheduler.deploy(&local_executable, &agent_binary)?;
        let advertise_ip = scheduler_advertise_ip(&scheduler.config().tasks);
        let bind_addr = SocketAddr::new(advertise_ip, 0);
        scheduler.connect(bind_addr)?;
        scheduler.start_jobs()?;
        scheduler.monitor_jobs(MONITOR_TICK)?;
        scheduler.quit_jobs();
        Ok(())
    })();

    if let Err(e) = &result {
        error!("job aborted: {e}");
        scheduler.kill_jobs();
    }
    result
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mr-scheduler: {e}");
            ExitCode::FAILURE
        }
    }
}
