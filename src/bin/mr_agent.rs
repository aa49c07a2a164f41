//! Agent binary: one per rank. Dials the scheduler, runs the dispatch loop,
//! and kills its worker on SIGTERM/SIGINT instead of leaving it orphaned.

use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use mrlite::agent::Agent;
use mrlite::config::AgentOptions;
use mrlite::remote_exec::SystemRemoteExec;

fn run() -> Result<(), mrlite::error::AgentError> {
    let opts = AgentOptions::parse();
    let exec = SystemRemoteExec::new(22);
    let mut agent = Agent::handshake(opts.scheduler_addr, opts.rank, &exec)?;

    let worker_pid = agent.worker_pid_handle();
    ctrlc::set_handler(move || {
        if let Ok(pid) = worker_pid.lock() {
            if let Some(pid) = *pid {
                info!("received termination signal, killing worker pid {pid}");
                let _ = std::process::Command::new("kill").arg(pid.to_string()).status();
            }
        }
        std::process::exit(1);
    })
    .expect("failed to install signal handler");

    agent.check_options()?;
    agent.run()
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mr-agent: {e}");
            eprintln!("mr-agent: {e}");
            ExitCode::FAILURE
        }
    }
}
