//! The `RemoteExec` abstraction (§5): runs commands locally or on a remote
//! host and copies files there, with a real SSH/SCP backend and a recording
//! mock for tests.

use std::path::Path;
use std::process::{Child, Command, ExitStatus};

use crate::error::RemoteExecError;

/// A PATH fixed the way the original launcher pins it, so agent/worker
/// processes don't inherit whatever happens to be on the scheduler's shell.
const FIXED_PATH: &str = "/usr/local/bin:/bin:/usr/bin:/sbin";

/// A spawned process the caller can poll, wait on, or kill, local child or
/// remote (over SSH) alike.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;
    /// Blocks until the process exits and returns its status code.
    fn wait(&mut self) -> Result<i32, RemoteExecError>;
    /// Non-blocking: `Some(code)` once exited, `None` if still running.
    fn try_wait(&mut self) -> Result<Option<i32>, RemoteExecError>;
    fn kill(&mut self) -> Result<(), RemoteExecError>;
}

/// Runs commands locally, on remote hosts, and copies files out.
pub trait RemoteExec: Send + Sync {
    fn run_local(&self, cmd: &str) -> Result<Box<dyn ProcessHandle>, RemoteExecError>;
    fn run_remote(
        &self,
        host: &str,
        cmd: &str,
    ) -> Result<Box<dyn ProcessHandle>, RemoteExecError>;
    /// Copies `files` to `dir` on `host`, creating `dir` first if needed.
    fn copy_files(&self, host: &str, files: &[&Path], dir: &str) -> Result<(), RemoteExecError>;
}

struct LocalHandle {
    child: Child,
    cmd: String,
}

impl ProcessHandle for LocalHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn wait(&mut self) -> Result<i32, RemoteExecError> {
        let status = self.child.wait().map_err(|source| RemoteExecError::Spawn {
            cmd: self.cmd.clone(),
            source,
        })?;
        Ok(exit_code(status))
    }

    fn try_wait(&mut self) -> Result<Option<i32>, RemoteExecError> {
        let status = self.child.try_wait().map_err(|source| RemoteExecError::Spawn {
            cmd: self.cmd.clone(),
            source,
        })?;
        Ok(status.map(exit_code))
    }

    fn kill(&mut self) -> Result<(), RemoteExecError> {
        self.child.kill().map_err(|source| RemoteExecError::Spawn {
            cmd: self.cmd.clone(),
            source,
        })
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn spawn_shell(cmd: &str) -> Result<Child, std::io::Error> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .env("PATH", FIXED_PATH)
        .spawn()
}

/// Production backend: local commands run in a `/bin/sh -c`, remote commands
/// run over SSH (feature `ssh`), file copies go over SCP.
pub struct SystemRemoteExec {
    ssh_port: u16,
}

impl SystemRemoteExec {
    pub fn new(ssh_port: u16) -> Self {
        Self { ssh_port }
    }
}

impl RemoteExec for SystemRemoteExec {
    fn run_local(&self, cmd: &str) -> Result<Box<dyn ProcessHandle>, RemoteExecError> {
        let child = spawn_shell(cmd).map_err(|source| RemoteExecError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;
        Ok(Box::new(LocalHandle {
            child,
            cmd: cmd.to_string(),
        }))
    }

    #[cfg(feature = "ssh")]
    fn run_remote(
        &self,
        host: &str,
        cmd: &str,
    ) -> Result<Box<dyn ProcessHandle>, RemoteExecError> {
        ssh_backend::run_remote(host, self.ssh_port, cmd)
    }

    #[cfg(not(feature = "ssh"))]
    fn run_remote(
        &self,
        host: &str,
        cmd: &str,
    ) -> Result<Box<dyn ProcessHandle>, RemoteExecError> {
        let ssh_cmd = format!("ssh -q -p {} {} '{}'", self.ssh_port, host, cmd);
        self.run_local(&ssh_cmd)
    }

    #[cfg(feature = "ssh")]
    fn copy_files(&self, host: &str, files: &[&Path], dir: &str) -> Result<(), RemoteExecError> {
        ssh_backend::copy_files(host, self.ssh_port, files, dir)
    }

    #[cfg(not(feature = "ssh"))]
    fn copy_files(&self, host: &str, files: &[&Path], dir: &str) -> Result<(), RemoteExecError> {
        let mkdir = format!("mkdir -p {dir}");
        let mut mkdir_proc = self.run_remote(host, &mkdir)?;
        let status = mkdir_proc.wait()?;
        if status != 0 {
            return Err(RemoteExecError::Copy {
                host: host.to_string(),
                dir: dir.to_string(),
                message: format!("mkdir exited with status {status}"),
            });
        }
        let file_args: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        let scp = format!(
            "scp -q -P {} {} {}:{}/",
            self.ssh_port,
            file_args.join(" "),
            host,
            dir
        );
        let mut scp_proc = self.run_local(&scp)?;
        let status = scp_proc.wait()?;
        if status != 0 {
            return Err(RemoteExecError::Copy {
                host: host.to_string(),
                dir: dir.to_string(),
                message: format!("scp exited with status {status}"),
            });
        }
        Ok(())
    }
}

#[cfg(feature = "ssh")]
mod ssh_backend {
    use super::*;
    use ssh2::Session;
    use std::io::Read as _;
    use std::net::TcpStream;

    /// An SSH channel running a remote command, polled by reading until EOF.
    /// `ssh2` channels have no asynchronous wait, so `try_wait` drains
    /// whatever output is currently buffered and only reports completion once
    /// the channel has closed.
    struct SshHandle {
        channel: ssh2::Channel,
        host: String,
        cmd: String,
        exited: Option<i32>,
    }

    impl ProcessHandle for SshHandle {
        fn pid(&self) -> u32 {
            0
        }

        fn wait(&mut self) -> Result<i32, RemoteExecError> {
            if let Some(code) = self.exited {
                return Ok(code);
            }
            let mut sink = Vec::new();
            self.channel
                .read_to_end(&mut sink)
                .map_err(|e| ssh_err(&self.host, e))?;
            self.channel.wait_close().map_err(|e| ssh_err(&self.host, e))?;
            let code = self.channel.exit_status().map_err(|e| ssh_err(&self.host, e))?;
            self.exited = Some(code);
            Ok(code)
        }

        fn try_wait(&mut self) -> Result<Option<i32>, RemoteExecError> {
            if let Some(code) = self.exited {
                return Ok(Some(code));
            }
            if self.channel.eof() {
                return Ok(Some(self.wait()?));
            }
            Ok(None)
        }

        fn kill(&mut self) -> Result<(), RemoteExecError> {
            self.channel.close().map_err(|e| ssh_err(&self.host, e))?;
            let _ = &self.cmd;
            Ok(())
        }
    }

    fn ssh_err(host: &str, e: ssh2::Error) -> RemoteExecError {
        RemoteExecError::Ssh {
            host: host.to_string(),
            message: e.to_string(),
        }
    }

    fn connect(host: &str, port: u16) -> Result<Session, RemoteExecError> {
        let tcp = TcpStream::connect((host, port)).map_err(|source| RemoteExecError::Spawn {
            cmd: format!("connect {host}:{port}"),
            source,
        })?;
        let mut session = Session::new().map_err(|e| ssh_err(host, e))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| ssh_err(host, e))?;
        let user = whoami::username();
        session
            .userauth_agent(&user)
            .map_err(|e| ssh_err(host, e))?;
        Ok(session)
    }

    pub fn run_remote(
        host: &str,
        port: u16,
        cmd: &str,
    ) -> Result<Box<dyn ProcessHandle>, RemoteExecError> {
        let session = connect(host, port)?;
        let mut channel = session.channel_session().map_err(|e| ssh_err(host, e))?;
        let escaped = shell_escape::escape(cmd.into());
        channel
            .exec(&escaped)
            .map_err(|e| ssh_err(host, e))?;
        Ok(Box::new(SshHandle {
            channel,
            host: host.to_string(),
            cmd: cmd.to_string(),
            exited: None,
        }))
    }

    pub fn copy_files(
        host: &str,
        port: u16,
        files: &[&Path],
        dir: &str,
    ) -> Result<(), RemoteExecError> {
        let session = connect(host, port)?;
        let sftp = session.sftp().map_err(|e| ssh_err(host, e))?;
        if sftp.stat(Path::new(dir)).is_err() {
            sftp.mkdir(Path::new(dir), 0o755)
                .map_err(|e| ssh_err(host, e))?;
        }
        for file in files {
            let bytes = std::fs::read(file).map_err(|source| RemoteExecError::Spawn {
                cmd: format!("read {}", file.display()),
                source,
            })?;
            let name = file.file_name().ok_or_else(|| RemoteExecError::Copy {
                host: host.to_string(),
                dir: dir.to_string(),
                message: format!("{} has no file name", file.display()),
            })?;
            let remote_path = Path::new(dir).join(name);
            let mut remote_file = session
                .scp_send(&remote_path, 0o755, bytes.len() as u64, None)
                .map_err(|e| ssh_err(host, e))?;
            std::io::Write::write_all(&mut remote_file, &bytes).map_err(|source| {
                RemoteExecError::Spawn {
                    cmd: format!("scp {}", remote_path.display()),
                    source,
                }
            })?;
        }
        Ok(())
    }
}

/// Records every invocation instead of shelling out; used by scheduler/agent
/// tests that need to assert on *what would have run* without a real network.
#[derive(Default)]
pub struct MockRemoteExec {
    pub local_calls: std::sync::Mutex<Vec<String>>,
    pub remote_calls: std::sync::Mutex<Vec<(String, String)>>,
    pub copies: std::sync::Mutex<Vec<(String, String)>>,
    /// Exit code returned by every spawned [`ProcessHandle`]; defaults to 0.
    pub exit_code: i32,
}

struct MockHandle {
    exit_code: i32,
}

impl ProcessHandle for MockHandle {
    fn pid(&self) -> u32 {
        1
    }
    fn wait(&mut self) -> Result<i32, RemoteExecError> {
        Ok(self.exit_code)
    }
    fn try_wait(&mut self) -> Result<Option<i32>, RemoteExecError> {
        Ok(Some(self.exit_code))
    }
    fn kill(&mut self) -> Result<(), RemoteExecError> {
        Ok(())
    }
}

impl RemoteExec for MockRemoteExec {
    fn run_local(&self, cmd: &str) -> Result<Box<dyn ProcessHandle>, RemoteExecError> {
        self.local_calls.lock().unwrap().push(cmd.to_string());
        Ok(Box::new(MockHandle {
            exit_code: self.exit_code,
        }))
    }

    fn run_remote(
        &self,
        host: &str,
        cmd: &str,
    ) -> Result<Box<dyn ProcessHandle>, RemoteExecError> {
        self.remote_calls
            .lock()
            .unwrap()
            .push((host.to_string(), cmd.to_string()));
        Ok(Box::new(MockHandle {
            exit_code: self.exit_code,
        }))
    }

    fn copy_files(&self, host: &str, _files: &[&Path], dir: &str) -> Result<(), RemoteExecError> {
        self.copies
            .lock()
            .unwrap()
            .push((host.to_string(), dir.to_string()));
        Ok(())
    }
}
