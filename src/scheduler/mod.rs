//! The scheduler: deploys artifacts, launches agents, drives the phase state
//! machine, monitors, and shuts the job down. Grounded directly in the
//! reference launcher's `MRLiteJobScheduler` (`start_communicators`,
//! `start_workers`, `monitor_jobs`, `quit_jobs`, `kill_jobs`).

mod monitor;

pub use monitor::{Phase, SchedulerState};

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::GlobalConfig;
use crate::error::{ProtocolError, SchedulerError};
use crate::protocol::{ControlChannel, FromAgent, ToAgent};
use crate::remote_exec::RemoteExec;
use crate::task::Rank;

/// One connected, handshaken agent.
struct AgentLink {
    channel: ControlChannel<TcpStream>,
    pid: u32,
}

/// Drives a single job end to end: deploy, connect, run phases, monitor,
/// shut down. Generic over [`RemoteExec`] so tests can swap in
/// [`crate::remote_exec::MockRemoteExec`].
pub struct Scheduler<'a, R: RemoteExec> {
    config: GlobalConfig,
    exec: &'a R,
    links: Vec<Option<AgentLink>>,
    state: SchedulerState,
}

impl<'a, R: RemoteExec> Scheduler<'a, R> {
    pub fn new(config: GlobalConfig, exec: &'a R) -> Self {
        let n = config.num_worker();
        Self {
            config,
            exec,
            links: (0..n).map(|_| None).collect(),
            state: SchedulerState::new(n),
        }
    }

    /// The job's global configuration, e.g. for picking an advertise address
    /// before [`Self::connect`].
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Stages the local executable under the job identity name, copies it
    /// (plus the agent binary) to every distinct host's tmp_dir, then deletes
    /// the local staged copy. §5 step 1.
    pub fn deploy(
        &mut self,
        local_executable: &Path,
        agent_binary: &Path,
    ) -> Result<(), SchedulerError> {
        self.state.set_phase(Phase::Deploying);
        let staged = local_executable.with_file_name(&self.config.job_identity);
        std::fs::copy(local_executable, &staged)?;

        let mut hosts: Vec<&str> = self
            .config
            .tasks
            .tasks
            .iter()
            .map(|t| t.host.as_str())
            .collect();
        hosts.sort_unstable();
        hosts.dedup();

        let targets: Vec<(&str, String)> = hosts
            .into_iter()
            .map(|host| (host, self.tmp_dir_for_host(host)))
            .collect();

        let exec = self.exec;
        let staged_path = staged.as_path();
        let result = thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|(host, tmp_dir)| {
                    info!("deploying to {host}:{tmp_dir}");
                    scope.spawn(move || {
                        exec.copy_files(host, &[staged_path, agent_binary], tmp_dir)
                            .map_err(SchedulerError::Deploy)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("deploy thread panicked"))
                .collect::<Result<Vec<()>, _>>()
        });

        std::fs::remove_file(&staged)?;
        result?;
        Ok(())
    }

    fn tmp_dir_for_host(&self, host: &str) -> String {
        self.config
            .tasks
            .tasks
            .iter()
            .find(|t| t.host == host)
            .map(|t| t.tmp_dir.clone())
            .unwrap_or_default()
    }

    /// Binds the scheduler listener, launches one agent per rank via
    /// `RemoteExec::run_remote`, then accepts exactly N handshakes. §5 steps
    /// 2-4.
    pub fn connect(&mut self, bind_addr: SocketAddr) -> Result<(), SchedulerError> {
        self.state.set_phase(Phase::Connecting);
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;

        let launches: Vec<(&str, String)> = (0..self.config.num_worker())
            .map(|rank| {
                let task = self.config.tasks.task(rank);
                let agent_cmd = format!(
                    "{}/mr-agent --scheduler-addr {}:{} --rank {}",
                    task.tmp_dir,
                    local_addr.ip(),
                    local_addr.port(),
                    rank,
                );
                info!("launching agent for rank {rank} on {}", task.host);
                (task.host.as_str(), agent_cmd)
            })
            .collect();

        let exec = self.exec;
        thread::scope(|scope| {
            let handles: Vec<_> = launches
                .iter()
                .map(|(host, agent_cmd)| {
                    scope.spawn(move || {
                        exec.run_remote(host, agent_cmd).map_err(SchedulerError::Deploy)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("agent-launch thread panicked"))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let n = self.config.num_worker();
        for _ in 0..n {
            let (stream, peer) = listener.accept()?;
            let mut channel = ControlChannel::new(stream);
            let reply = channel.recv_reply()?;
            let (rank, pid) = match reply {
                FromAgent::Handshake { rank, pid } => (rank, pid),
                other => {
                    return Err(SchedulerError::Protocol(ProtocolError::MalformedMessage(
                        format!("expected handshake, got {other:?}"),
                    )))
                }
            };
            debug!("rank {rank} handshook from {peer}, pid={pid}");
            channel.send_config(&self.config)?;
            self.links[rank] = Some(AgentLink { channel, pid });
            self.state.mark_connected(rank);
        }

        if self.state.connected_count() != n {
            return Err(SchedulerError::HandshakeIncomplete {
                expected: n,
                got: self.state.connected_count(),
            });
        }
        Ok(())
    }

    fn link_mut(&mut self, rank: Rank) -> &mut ControlChannel<TcpStream> {
        &mut self.links[rank].as_mut().expect("rank connected").channel
    }

    /// Batch two-phase mode is the only one where the agent replies
    /// `mapper_finished` once its mapper exits (see `Agent::wait_mapper`), so
    /// it's the only one where waiting for that ack here makes sense.
    fn start_mappers_awaiting_ack(&mut self) -> Result<(), SchedulerError> {
        info!("start {} map workers", self.config.tasks.num_map_worker);
        for rank in self.config.tasks.mapper_ranks() {
            self.link_mut(rank).send_instruction(&ToAgent::StartMapper)?;
        }
        for rank in self.config.tasks.mapper_ranks() {
            let reply = self.link_mut(rank).recv_reply()?;
            if reply != FromAgent::MapperFinished {
                return Err(SchedulerError::Protocol(ProtocolError::MalformedMessage(
                    format!("rank {rank}: expected mapper_finished, got {reply:?}"),
                )));
            }
        }
        Ok(())
    }

    /// Map-only and incremental mode never get a `mapper_finished` reply
    /// (the agent returns silently in both, see `Agent::wait_mapper`), so
    /// completion is only ever observed later via `status` polling.
    fn dispatch_mappers(&mut self) -> Result<(), SchedulerError> {
        info!("start {} map workers", self.config.tasks.num_map_worker);
        for rank in self.config.tasks.mapper_ranks() {
            self.link_mut(rank).send_instruction(&ToAgent::StartMapper)?;
        }
        Ok(())
    }

    /// Incremental mode starts reducers ahead of mappers and needs to know
    /// each one is actually listening before mappers start feeding it, so it
    /// waits for the `reducer_started` ack the agent sends in that mode.
    fn start_reducers_awaiting_ack(&mut self) -> Result<(), SchedulerError> {
        info!("start {} reduce workers", self.config.tasks.num_reduce_worker);
        for rank in self.config.tasks.reducer_ranks() {
            self.link_mut(rank).send_instruction(&ToAgent::StartReducer)?;
        }
        for rank in self.config.tasks.reducer_ranks() {
            let reply = self.link_mut(rank).recv_reply()?;
            if reply != FromAgent::ReducerStarted {
                return Err(SchedulerError::Protocol(ProtocolError::MalformedMessage(
                    format!("rank {rank}: expected reducer_started, got {reply:?}"),
                )));
            }
        }
        Ok(())
    }

    /// Batch mode starts reducers last and just lets them run; the agent
    /// doesn't reply to `start_reducer` in this mode, it only ever speaks
    /// again in response to a later `status` poll.
    fn dispatch_reducers(&mut self) -> Result<(), SchedulerError> {
        info!("start {} reduce workers", self.config.tasks.num_reduce_worker);
        for rank in self.config.tasks.reducer_ranks() {
            self.link_mut(rank).send_instruction(&ToAgent::StartReducer)?;
        }
        Ok(())
    }

    /// Drives the two phases in batch or incremental order, or just the
    /// mapper phase in map-only mode. §5 steps 5-6 / §4.3.
    pub fn start_jobs(&mut self) -> Result<(), SchedulerError> {
        if self.config.tasks.map_only {
            self.state.set_phase(Phase::Phase1);
            self.dispatch_mappers()?;
            return Ok(());
        }
        if self.config.incremental {
            self.state.set_phase(Phase::Phase1);
            self.start_reducers_awaiting_ack()?;
            self.state.set_phase(Phase::Phase2);
            self.dispatch_mappers()?;
        } else {
            self.state.set_phase(Phase::Phase1);
            self.start_mappers_awaiting_ack()?;
            self.state.set_phase(Phase::Phase2);
            self.dispatch_reducers()?;
        }
        Ok(())
    }

    fn worker_name(&self, rank: Rank) -> String {
        let task = self.config.tasks.task(rank);
        let kind = if self.config.tasks.is_mapper(rank) {
            "Mapper"
        } else {
            "Reducer"
        };
        format!(
            "{kind}-{}({}, {})",
            self.config.tasks.local_rank(rank),
            task.host,
            task.user_class
        )
    }

    /// Polls every still-running rank every `tick` (5s in production),
    /// stopping when all ranks have reported `Finished`, or returning as soon
    /// as any rank reports `Failed`. §5 step 7.
    pub fn monitor_jobs(&mut self, tick: Duration) -> Result<(), SchedulerError> {
        self.state.set_phase(Phase::Monitoring);
        loop {
            let running: Vec<Rank> = self.state.running_ranks();
            if running.is_empty() {
                break;
            }
            for rank in running {
                self.link_mut(rank)
                    .send_instruction(&ToAgent::Status)
                    .map_err(|source| SchedulerError::AgentLost { rank, source })?;
                let reply = self
                    .link_mut(rank)
                    .recv_reply()
                    .map_err(|source| SchedulerError::AgentLost { rank, source })?;
                match reply {
                    FromAgent::Finished => {
                        debug!("{} finished well", self.worker_name(rank));
                        self.state.mark_finished(rank);
                    }
                    FromAgent::Failed => {
                        let name = self.worker_name(rank);
                        return Err(SchedulerError::WorkerFailed { rank, name });
                    }
                    FromAgent::Running(_) => {}
                    other => warn!("rank {rank}: unexpected status reply {other:?}"),
                }
            }
            if self.state.running_ranks().is_empty() {
                break;
            }
            thread::sleep(tick);
        }
        self.state.set_phase(Phase::Draining);
        Ok(())
    }

    /// Sends `quit` to every connected rank so agents clean up their tmp_dir
    /// and exit normally.
    pub fn quit_jobs(&mut self) {
        for rank in 0..self.config.num_worker() {
            if self.links[rank].is_some() {
                if let Err(e) = self.link_mut(rank).send_instruction(&ToAgent::Quit) {
                    warn!("failed to send quit to rank {rank}: {e}");
                }
            }
        }
        self.state.set_phase(Phase::Done);
    }

    /// Kills every agent process by recorded PID over SSH. Idempotent: ranks
    /// with no recorded PID (never connected) are skipped rather than
    /// erroring, and a second call after the phase is already `Aborted` is a
    /// no-op rather than re-issuing every kill command.
    pub fn kill_jobs(&mut self) {
        if self.state.phase() == Phase::Aborted {
            return;
        }
        self.state.set_phase(Phase::Aborted);
        for rank in 0..self.config.num_worker() {
            let Some(link) = &self.links[rank] else {
                continue;
            };
            let task = self.config.tasks.task(rank);
            let cmd = format!("kill -15 {} >/dev/null 2>&1", link.pid);
            if let Err(e) = self.exec.run_remote(&task.host, &cmd) {
                error!("failed to kill rank {rank} ({}): {e}", task.host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_exec::MockRemoteExec;
    use crate::task::{Task, TaskList};
    use std::thread;

    fn sample_config() -> GlobalConfig {
        GlobalConfig {
            job_identity: "wc-alice-2024-01-01-00-00".to_string(),
            tasks: TaskList {
                tasks: vec![
                    Task {
                        host: "127.0.0.1".to_string(),
                        user_class: "M".to_string(),
                        input_format: Some(crate::task::Format::Text),
                        input_path: "/in/*".to_string(),
                        output_format: None,
                        output_path: "/out".to_string(),
                        tmp_dir: "/tmp/mrlite".to_string(),
                        log_filebase: "/tmp/mrlite/log".to_string(),
                    },
                    Task {
                        host: "127.0.0.1".to_string(),
                        user_class: "R".to_string(),
                        input_format: None,
                        input_path: "/out".to_string(),
                        output_format: Some(crate::task::Format::Text),
                        output_path: "/final".to_string(),
                        tmp_dir: "/tmp/mrlite".to_string(),
                        log_filebase: "/tmp/mrlite/log".to_string(),
                    },
                ],
                num_map_worker: 1,
                num_reduce_worker: 1,
                map_only: false,
            },
            incremental: false,
            force_mkdir: false,
            buffer_size: 1024,
            reduce_endpoints: vec![],
            ssh_port: 22,
            worker_cmd: vec![],
        }
    }

    /// Drives the scheduler side of a handshake against an in-process fake
    /// agent so `connect` can be exercised without `RemoteExec` actually
    /// launching anything.
    #[test]
    fn connect_completes_handshake_and_records_connected_count() {
        let exec = MockRemoteExec::default();
        let mut config = sample_config();
        config.tasks.tasks.truncate(1);
        config.tasks.num_reduce_worker = 0;
        let mut scheduler = Scheduler::new(config, &exec);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            let mut channel = ControlChannel::new(stream);
            channel
                .send_reply(&FromAgent::Handshake { rank: 0, pid: 4242 })
                .unwrap();
            let _config: GlobalConfig = channel.recv_config().unwrap();
        });

        scheduler.connect(addr).unwrap();
        handle.join().unwrap();
        assert_eq!(scheduler.state.connected_count(), 1);
    }

    #[test]
    fn kill_jobs_skips_ranks_that_never_connected() {
        let exec = MockRemoteExec::default();
        let config = sample_config();
        let mut scheduler = Scheduler::new(config, &exec);
        scheduler.kill_jobs();
        assert!(exec.remote_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn kill_jobs_is_idempotent() {
        let exec = MockRemoteExec::default();
        let mut config = sample_config();
        config.tasks.tasks.truncate(1);
        config.tasks.num_reduce_worker = 0;
        let mut scheduler = Scheduler::new(config, &exec);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let handle = thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            let mut channel = ControlChannel::new(stream);
            channel
                .send_reply(&FromAgent::Handshake { rank: 0, pid: 4242 })
                .unwrap();
            let _config: GlobalConfig = channel.recv_config().unwrap();
        });
        scheduler.connect(addr).unwrap();
        handle.join().unwrap();
        let calls_before_kill = exec.remote_calls.lock().unwrap().len();

        scheduler.kill_jobs();
        let calls_after_first = exec.remote_calls.lock().unwrap().len();
        assert_eq!(calls_after_first, calls_before_kill + 1);

        scheduler.kill_jobs();
        assert_eq!(exec.remote_calls.lock().unwrap().len(), calls_after_first);
        assert_eq!(scheduler.state.phase(), Phase::Aborted);
    }
}
