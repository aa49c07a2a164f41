//! Newline-delimited, percent-encoded message framing over a duplex stream.
//!
//! The wire format mirrors the scheduler/agent socket wrapper of the original
//! tool: `send` percent-encodes the payload so no newline can appear inside it
//! and appends a single `\n`; `recv` reads up to the first `\n` and decodes
//! what came before it. Bytes read past a delimiter are buffered for the next
//! `recv`, so message boundaries survive arbitrary fragmentation of the
//! underlying transport.

use std::io::{self, Read, Write};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::ProtocolError;

/// Escape newline (the frame delimiter) plus the usual "needs escaping in a
/// single line of text" set; percent-encoding guarantees the byte `\n`
/// (0x0A) never appears in an encoded payload.
const FRAME_UNSAFE: &AsciiSet = &CONTROLS.add(b'%').add(b'\n').add(b'\r');

/// A framed channel over any bidirectional byte stream (a `TcpStream` in
/// production, an in-memory duplex pipe in tests).
pub struct FramingChannel<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S> FramingChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Write> FramingChannel<S> {
    /// Percent-encode `payload` and write it followed by a single `\n`.
    pub fn send(&mut self, payload: &str) -> Result<(), ProtocolError> {
        let encoded = utf8_percent_encode(payload, FRAME_UNSAFE).to_string();
        self.stream.write_all(encoded.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        Ok(())
    }
}

impl<S: Read> FramingChannel<S> {
    /// Read until the next `\n`, decode, and return the message. Bytes read
    /// past the delimiter remain buffered for the following call.
    pub fn recv(&mut self) -> Result<String, ProtocolError> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                let decoded = percent_decode_str(std::str::from_utf8(line).map_err(|_| {
                    ProtocolError::MalformedMessage("non-utf8 framed line".into())
                })?)
                .decode_utf8()
                .map_err(|_| ProtocolError::MalformedMessage("invalid percent-encoding".into()))?
                .into_owned();
                return Ok(decoded);
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "control channel closed",
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Encode an arbitrary byte blob (e.g. the bincode-serialized global
/// configuration) to the 7-bit-safe alphabet required before it can be
/// framed as a single textual line.
pub fn encode_blob(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_blob(s: &str) -> Result<Vec<u8>, ProtocolError> {
    use base64::Engine;
    Ok(base64::engine::general_purpose::STANDARD.decode(s)?)
}
