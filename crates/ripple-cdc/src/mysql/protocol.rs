//! MySQL replication wire protocol
//!
//! Implements the client side of the replication handshake:
//! - Handshake and authentication (mysql_native_password, caching_sha2_password)
//! - COM_QUERY (session setup and single-value queries)
//! - COM_REGISTER_SLAVE
//! - COM_BINLOG_DUMP
//! - Binlog event streaming

use crate::common::{NodeAddr, Validator};
use crate::mysql::reader::ByteReader;
use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// MySQL packet header size (4 bytes: 3 for length + 1 for sequence)
const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload; larger payloads are split
const MAX_PACKET_SIZE: usize = 16_777_215;
/// utf8mb4_general_ci
const CHARSET_UTF8MB4: u8 = 45;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

/// MySQL capability flags
#[derive(Debug, Clone, Copy)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x00000001;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x00000008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x00000200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x00002000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x00008000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x00080000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x01000000;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn has(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Server greeting (protocol v10)
#[derive(Debug)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: CapabilityFlags,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let protocol_version = r.u8()?;
        if protocol_version != 10 {
            bail!("Unsupported handshake protocol version {}", protocol_version);
        }
        let server_version = read_nul_terminated(&mut r)?;
        let connection_id = r.u32_le()?;
        let mut auth_data = r.bytes(8)?.to_vec();
        r.skip(1)?;
        let cap_lower = r.u16_le()?;
        let character_set = r.u8()?;
        let status_flags = r.u16_le()?;
        let cap_upper = r.u16_le()?;
        let capability_flags =
            CapabilityFlags::new((u32::from(cap_upper) << 16) | u32::from(cap_lower));
        let auth_data_len = r.u8()? as usize;
        r.skip(10)?;

        // Second scramble part: max(13, len - 8) bytes, NUL terminated
        let part2_len = auth_data_len.saturating_sub(8).max(13).min(r.remaining());
        let part2 = r.bytes(part2_len)?;
        let part2 = match part2.iter().position(|&b| b == 0) {
            Some(end) => &part2[..end],
            None => part2,
        };
        auth_data.extend_from_slice(part2);

        let auth_plugin_name = if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH)
            && r.has_remaining()
        {
            read_nul_terminated(&mut r)?
        } else {
            "mysql_native_password".to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_data,
            auth_plugin_name,
        })
    }
}

fn read_nul_terminated(r: &mut ByteReader<'_>) -> Result<String> {
    let rest = r.rest();
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let value = String::from_utf8_lossy(r.bytes(end)?).into_owned();
    if r.has_remaining() {
        r.skip(1)?;
    }
    Ok(value)
}

/// `code - message` from an ERR packet.
fn server_error(packet: &[u8]) -> String {
    let code = match packet.get(1..3) {
        Some(b) => u16::from_le_bytes([b[0], b[1]]),
        None => return "malformed error packet".to_string(),
    };
    // Protocol 4.1 adds '#' plus a five-byte SQL state
    let message = match packet.get(3) {
        Some(b'#') => packet.get(9..).unwrap_or_default(),
        _ => packet.get(3..).unwrap_or_default(),
    };
    format!("{} - {}", code, String::from_utf8_lossy(message))
}

/// MySQL client connection speaking the replication protocol
pub struct MySqlBinlogClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for MySqlBinlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlBinlogClient")
            .field("sequence_id", &self.sequence_id)
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl MySqlBinlogClient {
    /// Connect to a node and authenticate.
    pub async fn connect(
        node: &NodeAddr,
        user: &str,
        password: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        Validator::validate_user(user)?;

        let addr = node.to_string();
        info!("Connecting to MySQL at {}", addr);

        let tcp_stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e).context(format!("Failed to connect to {}", addr)),
            Err(_) => bail!(
                "Connection timeout after {}s connecting to {}",
                connect_timeout.as_secs(),
                addr
            ),
        };
        tcp_stream.set_nodelay(true).ok();

        let mut client = Self {
            stream: BufReader::new(tcp_stream),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let handshake_data = timeout(connect_timeout, client.read_packet())
            .await
            .map_err(|_| anyhow!("Timed out waiting for handshake from {}", addr))??;
        if handshake_data.first() == Some(&0xFF) {
            bail!("Server refused connection: {}", server_error(&handshake_data));
        }
        let handshake =
            HandshakePacket::parse(&handshake_data).context("Failed to parse handshake packet")?;
        info!(
            "Connected to MySQL {} (connection_id={})",
            handshake.server_version, handshake.connection_id
        );
        debug!("Auth plugin: {}", handshake.auth_plugin_name);

        client.server_version = handshake.server_version.clone();
        client.connection_id = handshake.connection_id;
        timeout(connect_timeout, client.authenticate(user, password, &handshake))
            .await
            .map_err(|_| anyhow!("Authentication timed out against {}", addr))??;
        Ok(client)
    }

    /// Read one logical packet, joining 16MB continuation frames.
    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            self.stream
                .read_exact(&mut header)
                .await
                .context("Connection closed while reading packet header")?;
            let len =
                (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
            self.sequence_id = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .context("Connection closed while reading packet payload")?;
            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len > MAX_PACKET_SIZE {
            bail!("Packet too large: {} bytes", len);
        }
        let mut packet = BytesMut::with_capacity(PACKET_HEADER_SIZE + len);
        packet.put_uint_le(len as u64, 3);
        packet.put_u8(self.sequence_id);
        packet.put_slice(data);
        let stream = self.stream.get_mut();
        stream.write_all(&packet).await?;
        stream.flush().await?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        handshake: &HandshakePacket,
    ) -> Result<()> {
        let client_flags = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_TRANSACTIONS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_DEPRECATE_EOF;

        let auth_response = match handshake.auth_plugin_name.as_str() {
            "caching_sha2_password" => caching_sha2_password(password, &handshake.auth_data),
            "mysql_native_password" => mysql_native_password(password, &handshake.auth_data),
            other => {
                warn!(
                    "Unknown auth plugin: {}, trying mysql_native_password",
                    other
                );
                mysql_native_password(password, &handshake.auth_data)
            }
        };

        let mut response = BytesMut::with_capacity(128 + user.len());
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(CHARSET_UTF8MB4);
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(handshake.auth_plugin_name.as_bytes());
        response.put_u8(0);
        self.write_packet(&response).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => {
                debug!("Authentication successful");
                Ok(())
            }
            Some(0x01) => self.finish_caching_sha2(&resp).await,
            Some(0xFE) => {
                let mut r = ByteReader::new(&resp[1..]);
                let plugin = read_nul_terminated(&mut r)?;
                let rest = r.rest();
                // Scramble is NUL terminated on the wire
                let scramble = rest.strip_suffix(&[0]).unwrap_or(rest).to_vec();
                debug!("Auth switch to plugin: {}", plugin);
                self.handle_auth_switch(&plugin, &scramble, password).await
            }
            Some(0xFF) => bail!("Authentication failed: {}", server_error(&resp)),
            Some(other) => bail!("Unexpected auth response: 0x{:02X}", other),
            None => bail!("Empty auth response"),
        }
    }

    async fn handle_auth_switch(
        &mut self,
        plugin: &str,
        scramble: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        let auth_response = match plugin {
            "mysql_native_password" => mysql_native_password(password, scramble),
            "caching_sha2_password" => caching_sha2_password(password, scramble),
            _ => bail!("Unsupported auth plugin for switch: {}", plugin),
        };
        self.write_packet(&auth_response).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0x01) if plugin == "caching_sha2_password" => self.finish_caching_sha2(&resp).await,
            Some(0xFF) => bail!("Auth switch failed: {}", server_error(&resp)),
            _ => bail!("Unexpected auth switch response"),
        }
    }

    /// caching_sha2_password sends an extra status after the scramble.
    async fn finish_caching_sha2(&mut self, resp: &[u8]) -> Result<()> {
        match resp.get(1) {
            // fast auth success, OK packet follows
            Some(0x03) => {
                let ok = self.read_packet().await?;
                match ok.first() {
                    Some(0x00) => Ok(()),
                    Some(0xFF) => bail!("Authentication failed: {}", server_error(&ok)),
                    _ => bail!("Unexpected packet after fast auth"),
                }
            }
            // full auth needs TLS or RSA key exchange
            Some(0x04) => bail!(
                "caching_sha2_password full authentication requires a secure connection; \
                 authenticate once over TLS to populate the server cache"
            ),
            _ => bail!("Unexpected caching_sha2_password status"),
        }
    }

    /// Execute a statement, discarding any result set.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        self.query_first_value(sql).await.map(|_| ())
    }

    /// Execute a query and return the first column of the first row.
    pub async fn query_first_value(&mut self, sql: &str) -> Result<Option<String>> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => return Ok(None),
            Some(0xFF) => bail!("Query failed: {}", server_error(&resp)),
            None => bail!("Empty query response"),
            _ => {}
        }

        let column_count = ByteReader::new(&resp).packed_int()?;
        for _ in 0..column_count {
            self.read_packet().await?;
        }

        let mut first = None;
        loop {
            let row = self.read_packet().await?;
            match row.first() {
                // OK/EOF terminator
                Some(0xFE) if row.len() < 9 => return Ok(first.flatten()),
                Some(0xFF) => bail!("Query failed: {}", server_error(&row)),
                Some(0xFB) if first.is_none() => first = Some(None),
                Some(_) if first.is_none() => {
                    let mut r = ByteReader::new(&row);
                    let len = r.packed_int()? as usize;
                    first = Some(Some(String::from_utf8_lossy(r.bytes(len)?).into_owned()));
                }
                _ => {}
            }
        }
    }

    /// Tell the server which checksum the stream should carry.
    ///
    /// Returns whether events will have a CRC32 trailer.
    pub async fn negotiate_checksum(&mut self) -> Result<bool> {
        let algorithm = self
            .query_first_value("SELECT @@global.binlog_checksum")
            .await
            .unwrap_or_else(|e| {
                debug!("binlog_checksum not available: {}", e);
                None
            });

        // MySQL 8.0.26+ renamed the variable; older servers only know the master form
        if let Err(e) = self
            .query("SET @source_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            debug!("Falling back to @master_binlog_checksum: {}", e);
            self.query("SET @master_binlog_checksum = @@global.binlog_checksum")
                .await?;
        }

        Ok(algorithm.is_some_and(|a| !a.eq_ignore_ascii_case("NONE")))
    }

    /// Register as a replica with the given server id.
    pub async fn register_slave(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id
        self.write_packet(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => {
                info!("Registered as replica with server_id={}", server_id);
                Ok(())
            }
            Some(0xFF) => bail!("Failed to register as replica: {}", server_error(&resp)),
            _ => bail!("Unexpected response to COM_REGISTER_SLAVE"),
        }
    }

    /// Start streaming from `binlog_filename:binlog_position`.
    ///
    /// An empty file name starts from the oldest binlog on the server.
    pub async fn binlog_dump(
        mut self,
        server_id: u32,
        binlog_filename: &str,
        binlog_position: u32,
    ) -> Result<BinlogStream> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(binlog_filename.len() + 11);
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(binlog_position);
        packet.put_u16_le(0); // flags: block at end of log
        packet.put_u32_le(server_id);
        packet.put_slice(binlog_filename.as_bytes());
        self.write_packet(&packet).await?;

        info!(
            "Started binlog dump from {}:{}",
            if binlog_filename.is_empty() {
                "<oldest>"
            } else {
                binlog_filename
            },
            binlog_position
        );
        Ok(BinlogStream { client: self })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }
}

/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
fn mysql_native_password(password: Option<&str>, scramble: &[u8]) -> Vec<u8> {
    let Some(pwd) = password.filter(|p| !p.is_empty()) else {
        return Vec::new();
    };
    let stage1 = Sha1::digest(pwd.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
fn caching_sha2_password(password: Option<&str>, scramble: &[u8]) -> Vec<u8> {
    let Some(pwd) = password.filter(|p| !p.is_empty()) else {
        return Vec::new();
    };
    let hash1 = Sha256::digest(pwd.as_bytes());
    let hash2 = Sha256::digest(hash1);
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(scramble);
    let hash3 = hasher.finalize();
    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Live binlog stream; owns the connection it was started on.
#[derive(Debug)]
pub struct BinlogStream {
    client: MySqlBinlogClient,
}

impl BinlogStream {
    /// Next raw event (header + body), `None` when the server ends the stream.
    pub async fn next_event(&mut self) -> Result<Option<Bytes>> {
        let packet = self.client.read_packet().await?;
        match packet.first() {
            None => Ok(None),
            Some(0x00) => Ok(Some(Bytes::from(packet).slice(1..))),
            Some(0xFE) if packet.len() < 9 => {
                debug!("Received EOF in binlog stream");
                Ok(None)
            }
            Some(0xFF) => bail!("Binlog error: {}", server_error(&packet)),
            Some(other) => bail!("Unexpected binlog packet marker 0x{:02X}", other),
        }
    }

    pub fn server_version(&self) -> &str {
        self.client.server_version()
    }
}
