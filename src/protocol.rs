//! MySQL client/server protocol connection
//!
//! Implements the slice of protocol v10 a replication slave needs:
//! - handshake and `mysql_native_password` authentication;
//! - packet framing with multi-packet (≥ 0xFFFFFF) reassembly;
//! - COM_QUERY submission (result sets are parsed by the query client);
//! - COM_REGISTER_SLAVE and COM_BINLOG_DUMP;
//! - the binlog event stream.
//!
//! Every read can be interrupted from another thread through a
//! [`StopHandle`]; the interrupted read fails with
//! [`ReplicaError::Interrupted`], which the supervisor treats as a
//! transport error.

use crate::error::{ReplicaError, Result};
use crate::wire::{PacketReader, MAX_PACKET_PAYLOAD, PACKET_HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace};

/// TCP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Capability flags exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Capabilities this client asks for. EOF-terminated result sets are
    /// deliberately kept (no CLIENT_DEPRECATE_EOF): the text-protocol
    /// parser relies on the classic framing.
    pub fn default_client() -> Self {
        Self(
            Self::CLIENT_LONG_PASSWORD
                | Self::CLIENT_LONG_FLAG
                | Self::CLIENT_PROTOCOL_41
                | Self::CLIENT_TRANSACTIONS
                | Self::CLIENT_SECURE_CONNECTION
                | Self::CLIENT_PLUGIN_AUTH,
        )
    }
}

/// Initial greeting from the server.
#[derive(Debug)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: CapabilityFlags,
    pub character_set: u8,
    pub status_flags: u16,
    auth_plugin_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(data);

        let protocol_version = r.read_u8()?;
        if protocol_version != 10 {
            return Err(ReplicaError::protocol(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }

        let server_version = String::from_utf8_lossy(r.read_null_terminated()?).into_owned();
        let connection_id = r.read_u32()?;
        let mut auth_plugin_data = r.read_bytes(8)?.to_vec();
        r.skip(1)?; // filler
        let cap_lower = r.read_u16()?;
        let character_set = r.read_u8()?;
        let status_flags = r.read_u16()?;
        let cap_upper = r.read_u16()?;
        let capability_flags =
            CapabilityFlags::new(((cap_upper as u32) << 16) | cap_lower as u32);
        let auth_data_len = r.read_u8()? as usize;
        r.skip(10)?; // reserved

        if capability_flags.has(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let part2_len = auth_data_len.saturating_sub(8).max(13);
            let mut part2 = r.read_bytes(part2_len.min(r.remaining()))?.to_vec();
            if let Some(end) = part2.iter().position(|&b| b == 0) {
                part2.truncate(end);
            }
            auth_plugin_data.extend_from_slice(&part2);
        }

        let auth_plugin_name = if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            match r.read_null_terminated() {
                Ok(name) => String::from_utf8_lossy(name).into_owned(),
                // Some servers omit the trailing NUL on the last field
                Err(_) => String::from_utf8_lossy(r.read_rest()).into_owned(),
            }
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data,
            auth_plugin_name,
        })
    }

    /// Full scramble (both halves of the auth plugin data).
    pub fn auth_data(&self) -> &[u8] {
        &self.auth_plugin_data
    }
}

/// Shared interrupt used by `close_connection()`.
///
/// Safe to trigger from any thread while a read is in flight; the read
/// fails with [`ReplicaError::Interrupted`] and the flag stays set until
/// [`StopHandle::rearm`] is called for the next connection attempt.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    closed: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt the connection the handle is attached to.
    pub fn close_connection(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new connection attempt.
    pub fn rearm(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    async fn closed(&self) {
        loop {
            // Register before checking the flag so a concurrent
            // `close_connection()` cannot slip between the two.
            let notified = self.inner.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// An authenticated protocol connection.
pub struct Connection {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
    interrupt: StopHandle,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .field("sequence_id", &self.sequence_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect and authenticate with `mysql_native_password`.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
        interrupt: StopHandle,
    ) -> Result<Self> {
        let addr = format!("{host}:{port}");
        debug!(%addr, "connecting to primary");

        let tcp = match timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ReplicaError::connect_failed(format!("{addr}: {e}"))),
            Err(_) => {
                return Err(ReplicaError::connect_failed(format!(
                    "{addr}: timed out after {CONNECT_TIMEOUT_SECS}s"
                )))
            }
        };
        tcp.set_nodelay(true)
            .map_err(|e| ReplicaError::connect_failed(format!("{addr}: {e}")))?;

        let mut conn = Self {
            stream: BufReader::new(tcp),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
            interrupt,
        };

        let greeting = conn.read_packet().await?;
        if greeting.first() == Some(&0xFF) {
            return Err(conn.server_error(&greeting[1..]));
        }
        let handshake = HandshakePacket::parse(&greeting)?;
        conn.server_version = handshake.server_version.clone();
        conn.connection_id = handshake.connection_id;

        info!(
            server_version = %conn.server_version,
            connection_id = conn.connection_id,
            "connected to primary"
        );
        trace!(auth_plugin = %handshake.auth_plugin_name, "server auth plugin");

        conn.authenticate(user, password, &handshake).await?;
        Ok(conn)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.interrupt.clone()
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        handshake: &HandshakePacket,
    ) -> Result<()> {
        if !handshake
            .capability_flags
            .has(CapabilityFlags::CLIENT_PROTOCOL_41)
        {
            return Err(ReplicaError::protocol(
                "server does not speak protocol 4.1",
            ));
        }

        let scramble = match handshake.auth_plugin_name.as_str() {
            "" | "mysql_native_password" => {
                native_password_scramble(password, handshake.auth_data())
            }
            other => {
                // Ask for native password anyway; the server answers with
                // an auth-switch if it insists on something else.
                debug!(plugin = other, "server prefers another auth plugin");
                native_password_scramble(password, handshake.auth_data())
            }
        };

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(CapabilityFlags::default_client().value());
        response.put_u32_le(MAX_PACKET_PAYLOAD as u32);
        response.put_u8(45); // utf8mb4
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(scramble.len() as u8);
        response.put_slice(&scramble);
        response.put_slice(b"mysql_native_password");
        response.put_u8(0);

        self.write_packet_continuing(&response).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => {
                debug!("authentication accepted");
                Ok(())
            }
            Some(0xFE) => self.auth_switch(&reply, password).await,
            Some(0xFF) => Err(self.auth_error(&reply[1..])),
            other => Err(ReplicaError::protocol(format!(
                "unexpected auth reply {other:?}"
            ))),
        }
    }

    /// The server may switch plugins mid-auth; only a switch back to
    /// `mysql_native_password` is honored.
    async fn auth_switch(&mut self, packet: &[u8], password: Option<&str>) -> Result<()> {
        let mut r = PacketReader::new(&packet[1..]);
        let plugin = String::from_utf8_lossy(r.read_null_terminated()?).into_owned();
        let mut salt = r.read_rest().to_vec();
        if salt.last() == Some(&0) {
            salt.pop();
        }

        if plugin != "mysql_native_password" {
            return Err(ReplicaError::auth_failed(format!(
                "server requires unsupported auth plugin {plugin}"
            )));
        }

        debug!("auth switch to mysql_native_password");
        let scramble = native_password_scramble(password, &salt);
        self.write_packet_continuing(&scramble).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(self.auth_error(&reply[1..])),
            other => Err(ReplicaError::protocol(format!(
                "unexpected auth-switch reply {other:?}"
            ))),
        }
    }

    fn auth_error(&self, body: &[u8]) -> ReplicaError {
        match self.server_error(body) {
            ReplicaError::Server { code, message, .. } => {
                ReplicaError::auth_failed(format!("{code}: {message}"))
            }
            other => other,
        }
    }

    /// Parse an ERR packet body (everything after the 0xFF marker).
    pub(crate) fn server_error(&self, body: &[u8]) -> ReplicaError {
        let mut r = PacketReader::new(body);
        let code = match r.read_u16() {
            Ok(code) => code,
            Err(e) => return e,
        };
        let sqlstate = if matches!(r.peek_u8(), Ok(b'#')) {
            let _ = r.skip(1);
            match r.read_bytes(5) {
                Ok(s) => String::from_utf8_lossy(s).into_owned(),
                Err(_) => String::new(),
            }
        } else {
            String::new()
        };
        let message = String::from_utf8_lossy(r.read_rest()).into_owned();
        ReplicaError::Server {
            code,
            sqlstate,
            message,
        }
    }

    async fn read_exact_interruptible(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.interrupt.is_closed() {
            return Err(ReplicaError::Interrupted);
        }
        let interrupt = self.interrupt.clone();
        tokio::select! {
            res = self.stream.read_exact(buf) => {
                res.map_err(ReplicaError::from)?;
                Ok(())
            }
            _ = interrupt.closed() => Err(ReplicaError::Interrupted),
        }
    }

    /// Read one logical packet, joining continuation packets when the
    /// payload hits the 0xFFFFFF boundary.
    pub(crate) async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            self.read_exact_interruptible(&mut header).await?;
            let chunk_len =
                header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
            self.sequence_id = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + chunk_len, 0);
            self.read_exact_interruptible(&mut payload[start..]).await?;

            if chunk_len < MAX_PACKET_PAYLOAD {
                return Ok(payload);
            }
        }
    }

    /// Write a packet continuing the current sequence (handshake phase).
    async fn write_packet_continuing(&mut self, payload: &[u8]) -> Result<()> {
        self.write_packet_raw(payload).await
    }

    /// Write a command packet; commands restart the sequence at zero.
    pub(crate) async fn write_command(&mut self, payload: &[u8]) -> Result<()> {
        self.sequence_id = 0;
        self.write_packet_raw(payload).await
    }

    async fn write_packet_raw(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() >= MAX_PACKET_PAYLOAD {
            return Err(ReplicaError::length_overflow(format!(
                "outgoing packet of {} bytes",
                payload.len()
            )));
        }
        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        packet.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        packet.push(self.sequence_id);
        packet.extend_from_slice(payload);

        self.stream
            .get_mut()
            .write_all(&packet)
            .await
            .map_err(ReplicaError::WriteFailed)?;
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(ReplicaError::WriteFailed)?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    /// Run a statement for its side effect (session variables, checksum
    /// negotiation). A result set is drained and ignored.
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut packet = BytesMut::with_capacity(1 + sql.len());
        packet.put_u8(0x03); // COM_QUERY
        packet.put_slice(sql.as_bytes());
        self.write_command(&packet).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(self.server_error(&reply[1..])),
            _ => {
                // Result set: read to the trailing EOF and discard
                let mut eof_seen = 0;
                while eof_seen < 2 {
                    let packet = self.read_packet().await?;
                    if packet.first() == Some(&0xFF) {
                        return Err(self.server_error(&packet[1..]));
                    }
                    if packet.first() == Some(&0xFE) && packet.len() < 9 {
                        eof_seen += 1;
                    }
                }
                Ok(())
            }
        }
    }

    /// Register as a replication slave. Host, user and password fields are
    /// sent empty; the primary only needs the server id and port.
    pub async fn register_slave(&mut self, server_id: u32, port: u16) -> Result<()> {
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(0x15); // COM_REGISTER_SLAVE
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(port);
        packet.put_u32_le(0); // replication rank, unused
        packet.put_u32_le(0); // master id

        self.write_command(&packet).await?;
        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => {
                info!(server_id, "registered as replication slave");
                Ok(())
            }
            Some(0xFF) => Err(self.server_error(&reply[1..])),
            other => Err(ReplicaError::protocol(format!(
                "unexpected COM_REGISTER_SLAVE reply {other:?}"
            ))),
        }
    }

    /// Request the binlog dump starting at `(log_name, position)`.
    pub async fn binlog_dump(
        &mut self,
        server_id: u32,
        log_name: &str,
        position: u64,
    ) -> Result<BinlogStream<'_>> {
        let position = u32::try_from(position).map_err(|_| {
            ReplicaError::invalid_config(format!(
                "binlog offset {position} exceeds the dump command range"
            ))
        })?;

        let mut packet = BytesMut::with_capacity(11 + log_name.len());
        packet.put_u8(0x12); // COM_BINLOG_DUMP
        packet.put_u32_le(position);
        packet.put_u16_le(0); // flags
        packet.put_u32_le(server_id);
        packet.put_slice(log_name.as_bytes());

        self.write_command(&packet).await?;
        info!(log_name, position, "binlog dump started");
        Ok(BinlogStream { conn: self })
    }
}

/// Stream of raw binlog events riding on a connection.
pub struct BinlogStream<'a> {
    conn: &'a mut Connection,
}

impl BinlogStream<'_> {
    /// Next event frame, without the network OK prefix. `Ok(None)` means
    /// the server ended the dump (EOF packet).
    pub async fn next_event(&mut self) -> Result<Option<Bytes>> {
        let packet = self.conn.read_packet().await?;
        match packet.first() {
            Some(0x00) => Ok(Some(Bytes::from(packet).slice(1..))),
            Some(0xFE) if packet.len() < 9 => {
                debug!("binlog stream ended with EOF");
                Ok(None)
            }
            Some(0xFF) => Err(self.conn.server_error(&packet[1..])),
            Some(_) => Err(ReplicaError::protocol(
                "binlog stream packet without OK prefix",
            )),
            None => Err(ReplicaError::UnexpectedEof),
        }
    }
}

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
pub(crate) fn native_password_scramble(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => Vec::new(),
        Some(pwd) => {
            let stage1 = Sha1::digest(pwd.as_bytes());
            let stage2 = Sha1::digest(stage1);

            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(stage2);
            let stage3 = hasher.finalize();

            stage1
                .iter()
                .zip(stage3.iter())
                .map(|(a, b)| a ^ b)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_bytes(plugin: &str) -> Vec<u8> {
        let mut data = Vec::new();
        data.push(10); // protocol version
        data.extend_from_slice(b"8.0.36\0");
        data.extend_from_slice(&7u32.to_le_bytes()); // connection id
        data.extend_from_slice(b"12345678"); // auth data part 1
        data.push(0); // filler
        let caps = CapabilityFlags::default_client().value();
        data.extend_from_slice(&(caps as u16).to_le_bytes());
        data.push(45); // charset
        data.extend_from_slice(&2u16.to_le_bytes()); // status
        data.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        data.push(21); // auth data total length
        data.extend_from_slice(&[0u8; 10]); // reserved
        data.extend_from_slice(b"901234567890\0"); // auth data part 2
        data.extend_from_slice(plugin.as_bytes());
        data.push(0);
        data
    }

    #[test]
    fn test_handshake_parse() {
        let packet = handshake_bytes("mysql_native_password");
        let handshake = HandshakePacket::parse(&packet).unwrap();
        assert_eq!(handshake.protocol_version, 10);
        assert_eq!(handshake.server_version, "8.0.36");
        assert_eq!(handshake.connection_id, 7);
        assert_eq!(handshake.auth_plugin_name, "mysql_native_password");
        assert_eq!(handshake.auth_data(), b"12345678901234567890");
        assert!(handshake
            .capability_flags
            .has(CapabilityFlags::CLIENT_PLUGIN_AUTH));
    }

    #[test]
    fn test_handshake_rejects_old_protocol() {
        let mut packet = handshake_bytes("mysql_native_password");
        packet[0] = 9;
        assert!(matches!(
            HandshakePacket::parse(&packet),
            Err(ReplicaError::Protocol(_))
        ));
    }

    #[test]
    fn test_native_password_scramble_shape() {
        let salt = b"12345678901234567890";
        let scramble = native_password_scramble(Some("password"), salt);
        assert_eq!(scramble.len(), 20);

        // Deterministic, password- and salt-sensitive
        assert_eq!(scramble, native_password_scramble(Some("password"), salt));
        assert_ne!(scramble, native_password_scramble(Some("other"), salt));
        assert_ne!(
            scramble,
            native_password_scramble(Some("password"), b"09876543210987654321")
        );
    }

    #[test]
    fn test_native_password_empty() {
        let salt = b"12345678901234567890";
        assert!(native_password_scramble(None, salt).is_empty());
        assert!(native_password_scramble(Some(""), salt).is_empty());
    }

    #[test]
    fn test_stop_handle_levels() {
        let handle = StopHandle::new();
        assert!(!handle.is_closed());
        handle.close_connection();
        assert!(handle.is_closed());
        handle.rearm();
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_stop_handle_wakes_waiters() {
        let handle = StopHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.closed().await;
            true
        });
        // Give the waiter a chance to park before signalling
        tokio::task::yield_now().await;
        handle.close_connection();
        assert!(tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap());
    }

    #[test]
    fn test_capability_flags() {
        let caps = CapabilityFlags::default_client();
        assert!(caps.has(CapabilityFlags::CLIENT_PROTOCOL_41));
        assert!(caps.has(CapabilityFlags::CLIENT_SECURE_CONNECTION));
        assert!(caps.has(CapabilityFlags::CLIENT_PLUGIN_AUTH));
    }
}
