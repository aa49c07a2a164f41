//! The scheduler↔agent control-plane vocabulary (§6 of the spec), layered on
//! top of [`crate::framing::FramingChannel`].

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::framing::{decode_blob, encode_blob, FramingChannel};
use crate::task::Rank;

/// Messages the scheduler sends to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToAgent {
    StartMapper,
    StartReducer,
    Status,
    Quit,
    Exit,
}

impl ToAgent {
    fn as_wire(&self) -> &'static str {
        match self {
            ToAgent::StartMapper => "start_mapper",
            ToAgent::StartReducer => "start_reducer",
            ToAgent::Status => "status",
            ToAgent::Quit => "quit",
            ToAgent::Exit => "exit",
        }
    }

    fn parse(s: &str) -> Result<ToAgent, ProtocolError> {
        match s {
            "start_mapper" => Ok(ToAgent::StartMapper),
            "start_reducer" => Ok(ToAgent::StartReducer),
            "status" => Ok(ToAgent::Status),
            "quit" => Ok(ToAgent::Quit),
            "exit" => Ok(ToAgent::Exit),
            other => Err(ProtocolError::MalformedMessage(format!(
                "unknown instruction `{other}`"
            ))),
        }
    }
}

/// Messages an agent sends back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromAgent {
    /// Handshake: `rank <r> <pid>`.
    Handshake { rank: Rank, pid: u32 },
    MapperFinished,
    ReducerStarted,
    Finished,
    Failed,
    /// A heartbeat carrying free-form process metrics, or the literal
    /// `Not-Sure` no-op heartbeat (preserved verbatim, see design notes).
    Running(String),
}

impl FromAgent {
    fn as_wire(&self) -> String {
        match self {
            FromAgent::Handshake { rank, pid } => format!("rank {rank} {pid}"),
            FromAgent::MapperFinished => "mapper_finished".to_string(),
            FromAgent::ReducerStarted => "reducer_started".to_string(),
            FromAgent::Finished => "Finished".to_string(),
            FromAgent::Failed => "Failed".to_string(),
            FromAgent::Running(s) => s.clone(),
        }
    }

    fn parse(s: &str) -> Result<FromAgent, ProtocolError> {
        if let Some(rest) = s.strip_prefix("rank ") {
            let mut parts = rest.split_whitespace();
            let rank: Rank = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| ProtocolError::MalformedMessage(s.to_string()))?;
            let pid: u32 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| ProtocolError::MalformedMessage(s.to_string()))?;
            return Ok(FromAgent::Handshake { rank, pid });
        }
        Ok(match s {
            "mapper_finished" => FromAgent::MapperFinished,
            "reducer_started" => FromAgent::ReducerStarted,
            "Finished" => FromAgent::Finished,
            "Failed" => FromAgent::Failed,
            other => FromAgent::Running(other.to_string()),
        })
    }
}

/// A [`FramingChannel`] specialized to the scheduler-side vocabulary: sends
/// [`ToAgent`] instructions, receives [`FromAgent`] replies, and carries the
/// one-shot global configuration blob.
pub struct ControlChannel<S> {
    inner: FramingChannel<S>,
}

impl<S> ControlChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: FramingChannel::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

impl<S: Write> ControlChannel<S> {
    pub fn send_instruction(&mut self, msg: &ToAgent) -> Result<(), ProtocolError> {
        self.inner.send(msg.as_wire())
    }

    pub fn send_reply(&mut self, msg: &FromAgent) -> Result<(), ProtocolError> {
        self.inner.send(&msg.as_wire())
    }

    /// Serialize `config` with bincode, base64-encode it, and frame it as a
    /// single line.
    pub fn send_config<T: Serialize>(&mut self, config: &T) -> Result<(), ProtocolError> {
        let bytes = bincode::serde::encode_to_vec(config, bincode::config::standard())?;
        self.inner.send(&encode_blob(&bytes))
    }
}

impl<S: Read> ControlChannel<S> {
    pub fn recv_instruction(&mut self) -> Result<ToAgent, ProtocolError> {
        let line = self.inner.recv()?;
        ToAgent::parse(&line)
    }

    pub fn recv_reply(&mut self) -> Result<FromAgent, ProtocolError> {
        let line = self.inner.recv()?;
        FromAgent::parse(&line)
    }

    pub fn recv_config<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T, ProtocolError> {
        let line = self.inner.recv()?;
        let bytes = decode_blob(&line)?;
        let (config, _len) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_wire_roundtrip() {
        for msg in [
            ToAgent::StartMapper,
            ToAgent::StartReducer,
            ToAgent::Status,
            ToAgent::Quit,
            ToAgent::Exit,
        ] {
            assert_eq!(ToAgent::parse(msg.as_wire()).unwrap(), msg);
        }
    }

    #[test]
    fn reply_wire_roundtrip() {
        for msg in [
            FromAgent::Handshake { rank: 3, pid: 4242 },
            FromAgent::MapperFinished,
            FromAgent::ReducerStarted,
            FromAgent::Finished,
            FromAgent::Failed,
            FromAgent::Running("Not-Sure".into()),
            FromAgent::Running("Running 4242 R 0.1 1.2".into()),
        ] {
            assert_eq!(FromAgent::parse(&msg.as_wire()).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_instruction_is_rejected() {
        assert!(ToAgent::parse("flibbertigibbet").is_err());
    }
}
