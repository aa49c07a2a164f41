//! The agent: one process per rank, resident on the task's host. Accepts
//! instructions from the scheduler's control channel and drives the local
//! worker binary. Grounded in the reference `Communicator`/`Worker` classes.

pub mod shuffle;
pub mod worker_cmd;

use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::error::AgentError;
use crate::protocol::{ControlChannel, FromAgent, ToAgent};
use crate::remote_exec::{ProcessHandle, RemoteExec};
use crate::task::{Rank, Role};

/// The `--mr_*`-driven local worker process started by `start_mapper` /
/// `start_reducer`, plus the bookkeeping needed to answer `status` and to
/// shut it down on `quit`/SIGTERM.
struct RunningWorker {
    handle: Box<dyn ProcessHandle>,
    num_reduce_buffer: usize,
}

/// One agent: a single rank's connection to the scheduler plus its worker
/// process. Parameterized over [`RemoteExec`] so tests can inject
/// [`crate::remote_exec::MockRemoteExec`].
pub struct Agent<'a, R: RemoteExec> {
    rank: Rank,
    config: GlobalConfig,
    channel: ControlChannel<TcpStream>,
    exec: &'a R,
    worker: Option<RunningWorker>,
    pid: u32,
    /// The running worker's pid, shared with a signal handler so SIGTERM can
    /// kill it without needing to interrupt `run`'s blocking read of the
    /// control channel.
    worker_pid: Arc<Mutex<Option<u32>>>,
}

impl<'a, R: RemoteExec> Agent<'a, R> {
    /// Dials the scheduler, sends the `rank <r> <pid>` handshake, and
    /// receives the global configuration. §5 step 4 from the agent's side.
    pub fn handshake(
        scheduler_addr: SocketAddr,
        rank: Rank,
        exec: &'a R,
    ) -> Result<Self, AgentError> {
        let stream = TcpStream::connect(scheduler_addr)?;
        let mut channel = ControlChannel::new(stream);
        let pid = std::process::id();
        channel.send_reply(&FromAgent::Handshake { rank, pid })?;
        let config: GlobalConfig = channel.recv_config()?;
        info!("rank {rank} handshook with scheduler, job {}", config.job_identity);
        Ok(Self {
            rank,
            config,
            channel,
            exec,
            worker: None,
            pid,
            worker_pid: Arc::new(Mutex::new(None)),
        })
    }

    /// A shared handle to the running worker's pid, for a signal handler
    /// installed outside the dispatch loop to read without locking the whole
    /// agent.
    pub fn worker_pid_handle(&self) -> Arc<Mutex<Option<u32>>> {
        Arc::clone(&self.worker_pid)
    }

    fn role(&self) -> Role {
        self.config.tasks.role(self.rank)
    }

    fn is_map_worker(&self) -> bool {
        matches!(self.role(), Role::Mapper | Role::MapOnlyMapper)
    }

    fn is_reduce_worker(&self) -> bool {
        matches!(self.role(), Role::Reducer)
    }

    /// Validates (or creates, under `force_mkdir`) the directories this
    /// rank's task needs before any worker runs. §4.1 validation rules.
    pub fn check_options(&self) -> Result<(), AgentError> {
        let task = self.config.tasks.task(self.rank);
        let output_path = if self.is_map_worker() {
            task.output_path.clone()
        } else {
            Path::new(&task.output_path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let log_path = Path::new(&task.log_filebase)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = task.tmp_dir.clone();

        if self.config.force_mkdir {
            let mut paths = vec![output_path.clone(), log_path.clone(), tmp_path.clone()];
            if self.is_reduce_worker() {
                paths.push(task.input_path.clone());
            }
            for path in paths {
                if !path.is_empty() && !Path::new(&path).exists() {
                    let cmd = format!("mkdir -p {path}");
                    self.exec
                        .run_local(&cmd)
                        .map_err(AgentError::RemoteExec)?
                        .wait()
                        .map_err(AgentError::RemoteExec)?;
                }
            }
            return Ok(());
        }

        if self.is_map_worker() {
            let matches = glob::glob(&task.input_path)
                .map_err(|e| AgentError::Io(std::io::Error::other(e)))?
                .filter_map(Result::ok)
                .count();
            if matches == 0 {
                return Err(AgentError::EmptyInputPattern(task.input_path.clone()));
            }
        } else if !Path::new(&task.input_path).exists() {
            return Err(AgentError::MissingPath(task.input_path.clone().into()));
        }

        if !output_path.is_empty() && !Path::new(&output_path).exists() {
            return Err(AgentError::MissingPath(output_path.into()));
        }
        if !log_path.is_empty() && !Path::new(&log_path).exists() {
            return Err(AgentError::MissingPath(log_path.into()));
        }
        Ok(())
    }

    /// Runs the dispatch loop: blocks on the next instruction, handles it,
    /// repeats until `quit`/`exit` closes the socket. §6.
    pub fn run(&mut self) -> Result<(), AgentError> {
        loop {
            let instruction = self.channel.recv_instruction()?;
            debug!("rank {} accepted instruction: {instruction:?}", self.rank);
            match instruction {
                ToAgent::StartMapper if self.is_map_worker() => self.start_mapper()?,
                ToAgent::StartReducer if self.is_reduce_worker() => self.start_reducer()?,
                ToAgent::Status => self.report_status()?,
                ToAgent::Quit | ToAgent::Exit => {
                    self.clean_tmp_files()?;
                    return Ok(());
                }
                other => warn!("rank {}: instruction {other:?} not valid for this role", self.rank),
            }
        }
    }

    fn start_mapper(&mut self) -> Result<(), AgentError> {
        let batch = !self.config.incremental;
        let cmd = if self.config.tasks.map_only {
            worker_cmd::maponly_worker_cmd(&self.config, self.rank)
        } else {
            worker_cmd::map_worker_cmd(&self.config, self.rank)
        };
        let handle = self.exec.run_local(&cmd).map_err(AgentError::RemoteExec)?;
        *self.worker_pid.lock().expect("worker pid mutex poisoned") = Some(handle.pid());
        self.worker = Some(RunningWorker {
            handle,
            num_reduce_buffer: 0,
        });
        self.wait_mapper(batch)
    }

    fn wait_mapper(&mut self, batch: bool) -> Result<(), AgentError> {
        let worker = self.worker.as_mut().expect("mapper just started");
        worker.handle.wait().map_err(AgentError::RemoteExec)?;
        *self.worker_pid.lock().expect("worker pid mutex poisoned") = None;
        if !batch || self.config.tasks.map_only {
            return Ok(());
        }
        shuffle::push_reduce_buffers(&self.config, self.rank, self.exec)?;
        thread::sleep(Duration::from_millis(500));
        self.channel.send_reply(&FromAgent::MapperFinished)?;
        Ok(())
    }

    fn start_reducer(&mut self) -> Result<(), AgentError> {
        let batch = !self.config.incremental;
        let num_reduce_buffer = if batch {
            shuffle::prepare_reduce_buffers(&self.config, self.rank, self.exec)?
        } else {
            0
        };
        let cmd = worker_cmd::reduce_worker_cmd(&self.config, self.rank, num_reduce_buffer);
        let handle = self.exec.run_local(&cmd).map_err(AgentError::RemoteExec)?;
        *self.worker_pid.lock().expect("worker pid mutex poisoned") = Some(handle.pid());
        self.worker = Some(RunningWorker {
            handle,
            num_reduce_buffer,
        });
        if batch {
            let worker = self.worker.as_mut().expect("reducer just started");
            worker.handle.wait().map_err(AgentError::RemoteExec)?;
            *self.worker_pid.lock().expect("worker pid mutex poisoned") = None;
            thread::sleep(Duration::from_millis(500));
        } else {
            // Incremental mode starts reducers ahead of mappers and cannot
            // wait for them to finish here; a fixed settle delay gives the
            // reducer time to bind its shuffle listener before mappers start.
            thread::sleep(Duration::from_millis(500));
            self.channel.send_reply(&FromAgent::ReducerStarted)?;
        }
        Ok(())
    }

    /// Reports `Finished`/`Failed` once the worker process has exited, a
    /// `Running <metrics>` heartbeat while it's alive, or the `Not-Sure`
    /// no-op heartbeat when metrics sampling doesn't come back in the
    /// expected shape. If no child has been spawned yet, replies nothing.
    fn report_status(&mut self) -> Result<(), AgentError> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(());
        };
        let reply = match worker.handle.try_wait().map_err(AgentError::RemoteExec)? {
            Some(0) => FromAgent::Finished,
            Some(_) => FromAgent::Failed,
            None => sample_metrics(worker.handle.pid()),
        };
        self.channel.send_reply(&reply)?;
        Ok(())
    }

    fn clean_tmp_files(&self) -> Result<(), AgentError> {
        let task = self.config.tasks.task(self.rank);
        let cmd = format!("rm -rf {}/{} {}/*.pyc", task.tmp_dir, self.config.job_identity, task.tmp_dir);
        self.exec
            .run_local(&cmd)
            .map_err(AgentError::RemoteExec)?
            .wait()
            .map_err(AgentError::RemoteExec)?;
        Ok(())
    }

    /// SIGTERM handling: kill the worker child, then clean up and exit.
    pub fn kill_worker(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            if let Err(e) = worker.handle.kill() {
                warn!("rank {}: failed to kill worker process: {e}", self.rank);
            }
        }
        *self.worker_pid.lock().expect("worker pid mutex poisoned") = None;
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Samples the worker process's CPU/memory via `ps` (a one-off local
/// inspection, not a `RemoteExec` dispatch, the same split the reference
/// agent makes between `CmdTool` commands and its ad hoc `ps`/`top` probe).
fn sample_metrics(pid: u32) -> FromAgent {
    let output = Command::new("ps")
        .args(["-o", "pid,pcpu,pmem,etime", "-p", &pid.to_string(), "--no-headers"])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            let line = text.lines().next().unwrap_or("").trim();
            if line.is_empty() {
                FromAgent::Running("Not-Sure".to_string())
            } else {
                FromAgent::Running(format!("Running {pid} {line}"))
            }
        }
        _ => FromAgent::Running("Not-Sure".to_string()),
    }
}
