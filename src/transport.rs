//! Watch transport layer.
//!
//! Opens the byte stream to a watch over the phone developer connection
//! (WebSocket), a QEMU serial socket, or an emulator started by the SDK.
//! The phone connection carries data in WebSocket binary messages; QEMU and
//! emulator sockets carry it bare. Packet framing and request/response
//! handling belong to the protocol engine that runs on top of this stream.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cli::EmulatorPlatform;
use crate::error::ConnectionError;
use crate::websocket::{self, FrameDecoder, MessageAssembler, OP_BINARY, OP_CLOSE, OP_PING, OP_PONG};

pub const EMULATOR_STATE_FILE: &str = "emulator.json";

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Extra logging requested with high verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugOptions {
    pub log_packets: bool,
    pub log_protocol: bool,
}

impl DebugOptions {
    pub fn from_verbosity(verbosity: u8) -> Self {
        Self {
            log_packets: verbosity >= 3,
            log_protocol: verbosity >= 4,
        }
    }
}

/// How to reach the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    WebSocket { host: String, port: u16 },
    Qemu { host: String, port: u16 },
    ManagedEmulator { platform: EmulatorPlatform, state_path: PathBuf },
}

impl Transport {
    pub fn managed_emulator(platform: EmulatorPlatform, persist_dir: &Path) -> Self {
        Self::ManagedEmulator {
            platform,
            state_path: persist_dir.join(EMULATOR_STATE_FILE),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::WebSocket { host, port } => format!("phone at ws://{host}:{port}/"),
            Self::Qemu { host, port } => format!("QEMU at {host}:{port}"),
            Self::ManagedEmulator { platform, .. } => format!("{} emulator", platform.as_str()),
        }
    }

    fn is_websocket(&self) -> bool {
        matches!(self, Self::WebSocket { .. })
    }

    /// Open the stream. Returns it along with any bytes read past the handshake.
    async fn open(&self, debug: &DebugOptions) -> Result<(TcpStream, Vec<u8>), ConnectionError> {
        match self {
            Self::WebSocket { host, port } => {
                let mut stream = tcp_connect(host, *port).await?;
                let leftover = websocket::handshake(&mut stream, host, *port, debug).await?;
                Ok((stream, leftover))
            }
            Self::Qemu { host, port } => Ok((tcp_connect(host, *port).await?, Vec::new())),
            Self::ManagedEmulator { platform, state_path } => {
                let port = emulator_qemu_port(state_path, *platform)?;
                Ok((tcp_connect("127.0.0.1", port).await?, Vec::new()))
            }
        }
    }
}

async fn tcp_connect(host: &str, port: u16) -> Result<TcpStream, ConnectionError> {
    debug!("Connecting to {}:{}", host, port);
    TcpStream::connect((host, port))
        .await
        .map_err(|source| ConnectionError::Io {
            target: format!("{host}:{port}"),
            source,
        })
}

#[derive(Debug, Deserialize)]
struct EmulatorEntry {
    qemu: QemuInfo,
}

#[derive(Debug, Deserialize)]
struct QemuInfo {
    port: u16,
    #[serde(default)]
    pid: Option<u32>,
}

/// Look up the QEMU port of a running emulator for `platform`.
fn emulator_qemu_port(state_path: &Path, platform: EmulatorPlatform) -> Result<u16, ConnectionError> {
    let name = platform.as_str();
    if !state_path.exists() {
        return Err(ConnectionError::EmulatorNotRunning(name.to_string()));
    }

    let contents = fs::read_to_string(state_path)
        .map_err(|e| ConnectionError::EmulatorState(format!("{}: {}", state_path.display(), e)))?;
    let state: HashMap<String, EmulatorEntry> =
        serde_json::from_str(&contents).map_err(|e| ConnectionError::EmulatorState(e.to_string()))?;

    let entry = state
        .get(name)
        .ok_or_else(|| ConnectionError::EmulatorNotRunning(name.to_string()))?;
    debug!("Found {} emulator on port {} (pid {:?})", name, entry.qemu.port, entry.qemu.pid);
    Ok(entry.qemu.port)
}

async fn write_to(writer: &SharedWriter, bytes: &[u8]) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Forward bare stream data as it arrives.
async fn read_raw(mut reader: OwnedReadHalf, tx: mpsc::Sender<Vec<u8>>, log_packets: bool) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Watch closed the connection");
                break;
            }
            Ok(n) => {
                if log_packets {
                    debug!(target: "pebble::packets", "<- {}", hex::encode(&buf[..n]));
                }
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Read from watch failed: {}", e);
                break;
            }
        }
    }
}

/// Forward the payload of each binary WebSocket message, answering pings.
async fn read_websocket(
    mut reader: OwnedReadHalf,
    leftover: Vec<u8>,
    writer: SharedWriter,
    tx: mpsc::Sender<Vec<u8>>,
    log_packets: bool,
) {
    let mut decoder = FrameDecoder::new();
    decoder.push(&leftover);
    let mut assembler = MessageAssembler::default();
    let mut buf = [0u8; 4096];

    loop {
        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("Bad data from phone: {}", e);
                    return;
                }
            };

            if frame.masked {
                debug!("Phone sent a masked frame");
            }
            match frame.opcode {
                OP_CLOSE => {
                    debug!("Phone closed the WebSocket");
                    return;
                }
                OP_PING => {
                    let pong = websocket::client_frame(OP_PONG, &frame.payload);
                    if let Err(e) = write_to(&writer, &pong).await {
                        warn!("Failed to answer ping: {}", e);
                        return;
                    }
                }
                OP_PONG => {}
                _ => match assembler.push(frame) {
                    Ok(Some(message)) => {
                        if log_packets {
                            debug!(target: "pebble::packets", "<- {}", hex::encode(&message));
                        }
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Bad data from phone: {}", e);
                        return;
                    }
                },
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Phone closed the connection");
                return;
            }
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                warn!("Read from phone failed: {}", e);
                return;
            }
        }
    }
}

/// Connection to a watch.
pub struct PebbleConnection {
    transport: Transport,
    debug: DebugOptions,
    reader: Option<OwnedReadHalf>,
    writer: Option<SharedWriter>,
    leftover: Vec<u8>,
    incoming: Option<mpsc::Receiver<Vec<u8>>>,
    reader_task: Option<JoinHandle<()>>,
}

impl PebbleConnection {
    pub fn new(transport: Transport, debug: DebugOptions) -> Self {
        Self {
            transport,
            debug,
            reader: None,
            writer: None,
            leftover: Vec::new(),
            incoming: None,
            reader_task: None,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Open the transport stream.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        let (stream, leftover) = self.transport.open(&self.debug).await?;
        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(Arc::new(Mutex::new(writer)));
        self.leftover = leftover;
        debug!("Connected to {}", self.transport.describe());
        Ok(())
    }

    /// Start forwarding received data on a background task.
    pub fn run_async(&mut self) -> Result<(), ConnectionError> {
        let reader = self.reader.take().ok_or(ConnectionError::NotConnected)?;
        let writer = self.writer.clone().ok_or(ConnectionError::NotConnected)?;
        let (tx, rx) = mpsc::channel(64);
        let leftover = std::mem::take(&mut self.leftover);
        let log_packets = self.debug.log_packets;

        let task = if self.transport.is_websocket() {
            tokio::spawn(read_websocket(reader, leftover, writer, tx, log_packets))
        } else {
            tokio::spawn(read_raw(reader, tx, log_packets))
        };

        self.incoming = Some(rx);
        self.reader_task = Some(task);
        Ok(())
    }

    /// Send data to the watch, wrapped in a binary message on the phone connection.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let writer = self.writer.as_ref().ok_or(ConnectionError::NotConnected)?;
        if self.debug.log_packets {
            debug!(target: "pebble::packets", "-> {}", hex::encode(data));
        }

        let frame;
        let bytes = if self.transport.is_websocket() {
            frame = websocket::client_frame(OP_BINARY, data);
            frame.as_slice()
        } else {
            data
        };

        write_to(writer, bytes).await.map_err(|source| ConnectionError::Io {
            target: self.transport.describe(),
            source,
        })
    }

    /// Next chunk of received data, or `None` on timeout.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ConnectionError> {
        let incoming = self.incoming.as_mut().ok_or(ConnectionError::NotConnected)?;
        match tokio::time::timeout(timeout, incoming.recv()).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => Err(ConnectionError::Closed),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for PebbleConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Accepts one connection, reads the HTTP request head and answers with `response`.
    async fn accept_upgrade(listener: TcpListener, response: &[u8]) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        while websocket::find_header_end(&request).is_none() {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before sending the upgrade request");
            request.extend_from_slice(&buf[..n]);
        }
        let head = String::from_utf8_lossy(&request).to_string();
        assert!(head.starts_with("GET / HTTP/1.1\r\n"));
        assert!(head.contains("Upgrade: websocket\r\n"));
        assert!(head.contains("Sec-WebSocket-Key: "));
        socket.write_all(response).await.unwrap();
        socket
    }

    const SWITCHING: &[u8] =
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

    async fn websocket_server(response: &'static [u8]) -> u16 {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            let _socket = accept_upgrade(listener, response).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        port
    }

    async fn read_frame(socket: &mut TcpStream) -> websocket::Frame {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];
        loop {
            if let Some(frame) = decoder.next_frame().unwrap() {
                return frame;
            }
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before a full frame arrived");
            decoder.push(&buf[..n]);
        }
    }

    fn phone(port: u16) -> Transport {
        Transport::WebSocket {
            host: "127.0.0.1".into(),
            port,
        }
    }

    #[test]
    fn test_debug_options_from_verbosity() {
        assert_eq!(DebugOptions::from_verbosity(2), DebugOptions::default());
        assert!(DebugOptions::from_verbosity(3).log_packets);
        assert!(!DebugOptions::from_verbosity(3).log_protocol);
        assert!(DebugOptions::from_verbosity(4).log_protocol);
    }

    #[tokio::test]
    async fn test_websocket_frame_after_upgrade_headers_is_delivered() {
        // First binary frame arrives in the same read as the 101 response.
        let port = websocket_server(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n\x82\x01\x07",
        )
        .await;
        let mut connection = PebbleConnection::new(phone(port), DebugOptions::from_verbosity(4));

        connection.connect().await.unwrap();
        connection.run_async().unwrap();

        let chunk = connection.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(chunk, Some(vec![0x07]));
    }

    #[tokio::test]
    async fn test_websocket_send_writes_masked_binary_frame() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let mut socket = accept_upgrade(listener, SWITCHING).await;
            read_frame(&mut socket).await
        });

        let mut connection = PebbleConnection::new(phone(port), DebugOptions::from_verbosity(3));
        connection.connect().await.unwrap();
        connection.run_async().unwrap();
        connection.send(&[0x0a, 0x0b, 0x0c]).await.unwrap();

        let frame = server.await.unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OP_BINARY);
        assert!(frame.masked);
        assert_eq!(frame.payload, vec![0x0a, 0x0b, 0x0c]);
    }

    #[tokio::test]
    async fn test_websocket_ping_answered_and_messages_reassembled() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let mut socket = accept_upgrade(listener, SWITCHING).await;
            socket
                .write_all(&websocket::encode_frame(OP_PING, b"hb", None))
                .await
                .unwrap();
            let pong = read_frame(&mut socket).await;
            // "ab" then a final continuation "c"
            socket
                .write_all(&[0x02, 0x02, b'a', b'b', 0x80, 0x01, b'c'])
                .await
                .unwrap();
            socket
                .write_all(&websocket::encode_frame(OP_CLOSE, &[], None))
                .await
                .unwrap();
            pong
        });

        let mut connection = PebbleConnection::new(phone(port), DebugOptions::default());
        connection.connect().await.unwrap();
        connection.run_async().unwrap();

        let message = connection.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(message, Some(b"abc".to_vec()));
        let err = connection.recv_timeout(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));

        let pong = server.await.unwrap();
        assert_eq!(pong.opcode, OP_PONG);
        assert!(pong.masked);
        assert_eq!(pong.payload, b"hb");
    }

    #[tokio::test]
    async fn test_websocket_upgrade_rejected() {
        let port = websocket_server(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
        let mut connection = PebbleConnection::new(phone(port), DebugOptions::default());

        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Handshake { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_qemu_round_trip() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport = Transport::Qemu {
            host: "127.0.0.1".into(),
            port,
        };
        let mut connection = PebbleConnection::new(transport, DebugOptions::from_verbosity(3));
        connection.connect().await.unwrap();
        connection.run_async().unwrap();
        connection.send(&[0xfe, 0xed, 0x00]).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            let chunk = connection.recv_timeout(Duration::from_secs(2)).await.unwrap().unwrap();
            received.extend(chunk);
        }
        assert_eq!(received, vec![0xfe, 0xed, 0x00]);
    }

    #[tokio::test]
    async fn test_closed_connection_is_reported() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let transport = Transport::Qemu {
            host: "127.0.0.1".into(),
            port,
        };
        let mut connection = PebbleConnection::new(transport, DebugOptions::default());
        connection.connect().await.unwrap();
        connection.run_async().unwrap();

        let err = connection.recv_timeout(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }

    #[tokio::test]
    async fn test_run_async_requires_connect() {
        let transport = Transport::Qemu {
            host: "127.0.0.1".into(),
            port: 1,
        };
        let mut connection = PebbleConnection::new(transport, DebugOptions::default());
        assert!(matches!(connection.run_async(), Err(ConnectionError::NotConnected)));
        assert!(matches!(connection.send(b"x").await, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_managed_emulator_uses_recorded_port() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(EMULATOR_STATE_FILE),
            format!(r#"{{"basalt": {{"qemu": {{"port": {port}, "pid": 4242}}}}}}"#),
        )
        .unwrap();

        let transport = Transport::managed_emulator(EmulatorPlatform::Basalt, tmp.path());
        assert_eq!(transport.describe(), "basalt emulator");
        let mut connection = PebbleConnection::new(transport, DebugOptions::default());
        connection.connect().await.unwrap();
    }

    #[test]
    fn test_managed_emulator_not_running() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(EMULATOR_STATE_FILE);

        let err = emulator_qemu_port(&path, EmulatorPlatform::Aplite).unwrap_err();
        assert!(matches!(err, ConnectionError::EmulatorNotRunning(ref p) if p == "aplite"));

        fs::write(&path, r#"{"basalt": {"qemu": {"port": 5000}}}"#).unwrap();
        let err = emulator_qemu_port(&path, EmulatorPlatform::Aplite).unwrap_err();
        assert!(matches!(err, ConnectionError::EmulatorNotRunning(_)));
        assert_eq!(emulator_qemu_port(&path, EmulatorPlatform::Basalt).unwrap(), 5000);
    }

    #[test]
    fn test_managed_emulator_corrupt_state() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(EMULATOR_STATE_FILE);
        fs::write(&path, "{").unwrap();

        let err = emulator_qemu_port(&path, EmulatorPlatform::Basalt).unwrap_err();
        assert!(matches!(err, ConnectionError::EmulatorState(_)));
    }
}
