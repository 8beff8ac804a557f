//! Client side of the phone developer connection's WebSocket.
//!
//! Covers the HTTP upgrade and RFC 6455 framing. Frames we send are masked
//! binary frames; incoming fragments are reassembled into whole messages.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::transport::DebugOptions;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xa;

const MAX_HANDSHAKE_RESPONSE: usize = 8192;
const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Base64 of a random 16-byte nonce for `Sec-WebSocket-Key`.
pub fn handshake_key() -> String {
    STANDARD.encode(Uuid::new_v4().as_bytes())
}

fn mask_key() -> [u8; 4] {
    let nonce = Uuid::new_v4();
    let bytes = nonce.as_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Perform the HTTP upgrade. Returns bytes received after the response headers.
pub async fn handshake(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    debug: &DebugOptions,
) -> Result<Vec<u8>, ConnectionError> {
    let target = format!("ws://{host}:{port}/");
    let handshake_err = |reason: String| ConnectionError::Handshake {
        target: target.clone(),
        reason,
    };
    let io_err = |source| ConnectionError::Io {
        target: target.clone(),
        source,
    };

    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        handshake_key()
    );
    if debug.log_protocol {
        for line in request.lines().filter(|l| !l.is_empty()) {
            debug!(target: "pebble::protocol", "-> {}", line);
        }
    }
    stream.write_all(request.as_bytes()).await.map_err(io_err)?;

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&response) {
            break pos;
        }
        if response.len() > MAX_HANDSHAKE_RESPONSE {
            return Err(handshake_err("response headers too large".into()));
        }
        let n = stream.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            return Err(handshake_err("connection closed during handshake".into()));
        }
        response.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&response[..header_end]);
    if debug.log_protocol {
        for line in head.lines() {
            debug!(target: "pebble::protocol", "<- {}", line);
        }
    }

    let status_line = head.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("101") {
        return Err(handshake_err(format!("unexpected response '{status_line}'")));
    }

    Ok(response[header_end + 4..].to_vec())
}

/// Encode a single final frame, masked with `mask` when given.
pub fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x80 | (opcode & 0x0f));

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        frame.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

/// Masked binary frame, as a client must send it.
pub fn client_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode, payload, Some(mask_key()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Incremental frame parser over a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let fin = self.buf[0] & 0x80 != 0;
        let opcode = self.buf[0] & 0x0f;
        let masked = self.buf[1] & 0x80 != 0;

        let (len, mut offset) = match self.buf[1] & 0x7f {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64, 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            short => (short as u64, 2),
        };
        if len > MAX_FRAME_PAYLOAD {
            return Err(ConnectionError::Protocol(format!("frame of {len} bytes is too large")));
        }

        let key = if masked {
            if self.buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [
                self.buf[offset],
                self.buf[offset + 1],
                self.buf[offset + 2],
                self.buf[offset + 3],
            ];
            offset += 4;
            Some(key)
        } else {
            None
        };

        let end = offset + len as usize;
        if self.buf.len() < end {
            return Ok(None);
        }

        let mut payload: Vec<u8> = self.buf[offset..end].to_vec();
        if let Some(key) = key {
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
        }
        self.buf.drain(..end);

        Ok(Some(Frame {
            fin,
            opcode,
            masked,
            payload,
        }))
    }
}

/// Joins fragmented messages. Only binary messages are kept.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: Option<(u8, Vec<u8>)>,
}

impl MessageAssembler {
    /// Feed a data frame; returns a finished binary message.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Vec<u8>>, ConnectionError> {
        let (opcode, payload) = match (frame.opcode, self.partial.take()) {
            (OP_CONTINUATION, Some((opcode, mut payload))) => {
                payload.extend_from_slice(&frame.payload);
                (opcode, payload)
            }
            (OP_CONTINUATION, None) => {
                return Err(ConnectionError::Protocol("continuation without a message".into()));
            }
            (_, Some(_)) => {
                return Err(ConnectionError::Protocol("new message before the last one ended".into()));
            }
            (opcode, None) => (opcode, frame.payload),
        };

        if !frame.fin {
            self.partial = Some((opcode, payload));
            return Ok(None);
        }

        match opcode {
            OP_BINARY => Ok(Some(payload)),
            OP_TEXT => {
                debug!("Ignoring {} byte text message", payload.len());
                Ok(None)
            }
            other => Err(ConnectionError::Protocol(format!("unknown opcode {other:#x}"))),
        }
    }
}
