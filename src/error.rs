//! Error types for every layer of the core. Each layer gets its own
//! `thiserror` enum; they compose upward via `#[from]`/`#[source]` into
//! [`SchedulerError`] and [`AgentError`], the two top-level errors each
//! binary's `main` actually returns.

use std::net::AddrParseError;
use std::path::PathBuf;

/// Failures that can occur while turning task-spec strings into a [`crate::task::TaskList`].
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("malformed entry `{0}`: expected `{{hosts}}:field[:field...]`")]
    MalformedEntry(String),

    #[error("entry `{entry}` has {found} field(s), expected {expected}")]
    WrongFieldCount {
        entry: String,
        found: usize,
        expected: usize,
    },

    #[error("unknown format `{0}`, expected `text` or `recordio`")]
    UnknownFormat(String),

    #[error("host `{0}` has no entry in the tmp-dir map")]
    MissingTmpDir(String),

    #[error("host `{0}` has no entry in the log-filebase map")]
    MissingLogFilebase(String),

    #[error("failed to resolve host `{host}`: {source}")]
    HostResolution {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("in map-only mode, --map-io and --reduce-io must be absent")]
    MapOnlyConflict,

    #[error("--map-io and --reduce-io must both be provided in two-phase mode")]
    TwoPhaseIncomplete,

    #[error("local worker binary `{0}` does not exist")]
    MissingLocalExecutable(PathBuf),

    #[error("failed to allocate reduce listener ports: {0}")]
    PortAllocation(#[from] std::io::Error),

    #[error(transparent)]
    AddrParse(#[from] AddrParseError),
}

/// Failures in the [`crate::framing`] / [`crate::protocol`] wire layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error on control channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed control message `{0}`")]
    MalformedMessage(String),

    #[error("failed to decode percent-encoded payload: {0}")]
    PercentDecode(#[from] std::str::Utf8Error),

    #[error("failed to decode base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to (de)serialize global configuration: {0}")]
    Bincode(#[from] bincode::error::DecodeError),

    #[error("failed to serialize global configuration: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),

    #[error("control socket closed before handshake completed")]
    HandshakeClosed,
}

/// Failures from the [`crate::remote_exec`] transport.
#[derive(Debug, thiserror::Error)]
pub enum RemoteExecError {
    #[error("i/o error launching `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{cmd}` on {host} exited with status {status}")]
    NonZeroExit {
        host: String,
        cmd: String,
        status: i32,
    },

    #[error("ssh session error connecting to {host}: {message}")]
    Ssh { host: String, message: String },

    #[error("copy to {host}:{dir} failed: {message}")]
    Copy {
        host: String,
        dir: String,
        message: String,
    },
}

/// Top-level error returned by the scheduler binary / library entry points.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job specification is invalid: {0}")]
    Spec(#[from] SpecError),

    #[error("deploy to remote hosts failed: {0}")]
    Deploy(#[source] RemoteExecError),

    #[error("fewer than {expected} agents connected (got {got}) before the scheduler gave up")]
    HandshakeIncomplete { expected: usize, got: usize },

    #[error("worker at rank {rank} ({name}) failed")]
    WorkerFailed { rank: usize, name: String },

    #[error("lost contact with agent at rank {rank}: {source}")]
    AgentLost {
        rank: usize,
        #[source]
        source: ProtocolError,
    },

    #[error("interrupted by user")]
    Interrupted,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    RemoteExec(#[from] RemoteExecError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error returned by the agent binary / library entry points.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("path `{0}` does not exist and automatic mkdir is disabled")]
    MissingPath(PathBuf),

    #[error("input pattern `{0}` does not match any file")]
    EmptyInputPattern(String),

    #[error("no reduce buffer files matched pattern `{0}`")]
    EmptyReduceBuffers(String),

    #[error("failed to spawn worker child: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    RemoteExec(#[from] RemoteExecError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
