//! MySQL binlog event decoder
//!
//! Decodes MySQL binary log events:
//! - FORMAT_DESCRIPTION_EVENT (checksum detection)
//! - TABLE_MAP_EVENT
//! - WRITE_ROWS_EVENT (v1 and v2)
//! - UPDATE_ROWS_EVENT (v1 and v2)
//! - DELETE_ROWS_EVENT (v1 and v2)
//! - ROTATE_EVENT
//! - XID_EVENT (transaction commit)
//! - HEARTBEAT_LOG_EVENT
//!
//! Every other event type is skipped. The decoder is pure: no I/O, and the
//! table-map cache it keeps is valid for one connection only.

use super::json::decode_json;
use super::reader::{count_set_bits, is_bit_set, ByteReader};
use crate::common::{CdcError, CdcOp, ColumnValue, Result, RowChangeEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Binlog event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Query,
    Rotate,
    FormatDescription,
    Xid,
    TableMap,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Heartbeat,
    WriteRowsV2,
    UpdateRowsV2,
    DeleteRowsV2,
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    Other(u8),
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::Query,
            4 => Self::Rotate,
            15 => Self::FormatDescription,
            16 => Self::Xid,
            19 => Self::TableMap,
            23 => Self::WriteRowsV1,
            24 => Self::UpdateRowsV1,
            25 => Self::DeleteRowsV1,
            27 => Self::Heartbeat,
            30 => Self::WriteRowsV2,
            31 => Self::UpdateRowsV2,
            32 => Self::DeleteRowsV2,
            33 => Self::Gtid,
            34 => Self::AnonymousGtid,
            35 => Self::PreviousGtids,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Query => 2,
            Self::Rotate => 4,
            Self::FormatDescription => 15,
            Self::Xid => 16,
            Self::TableMap => 19,
            Self::WriteRowsV1 => 23,
            Self::UpdateRowsV1 => 24,
            Self::DeleteRowsV1 => 25,
            Self::Heartbeat => 27,
            Self::WriteRowsV2 => 30,
            Self::UpdateRowsV2 => 31,
            Self::DeleteRowsV2 => 32,
            Self::Gtid => 33,
            Self::AnonymousGtid => 34,
            Self::PreviousGtids => 35,
            Self::Other(code) => *code,
        }
    }

    /// Operation carried by a row event, `None` for everything else.
    pub fn row_operation(&self) -> Option<CdcOp> {
        match self {
            Self::WriteRowsV1 | Self::WriteRowsV2 => Some(CdcOp::Insert),
            Self::UpdateRowsV1 | Self::UpdateRowsV2 => Some(CdcOp::Update),
            Self::DeleteRowsV1 | Self::DeleteRowsV2 => Some(CdcOp::Delete),
            _ => None,
        }
    }

    pub fn is_row_event(&self) -> bool {
        self.row_operation().is_some()
    }

    fn is_rows_v2(&self) -> bool {
        matches!(
            self,
            Self::WriteRowsV2 | Self::UpdateRowsV2 | Self::DeleteRowsV2
        )
    }
}

/// MySQL column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    Varchar,
    Bit,
    Timestamp2,
    DateTime2,
    Time2,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    /// Legacy or unsupported type code
    Other(u8),
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::LongLong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::DateTime,
            13 => Self::Year,
            15 => Self::Varchar,
            16 => Self::Bit,
            17 => Self::Timestamp2,
            18 => Self::DateTime2,
            19 => Self::Time2,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249 => Self::TinyBlob,
            250 => Self::MediumBlob,
            251 => Self::LongBlob,
            252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Tiny => 1,
            Self::Short => 2,
            Self::Long => 3,
            Self::Float => 4,
            Self::Double => 5,
            Self::Null => 6,
            Self::Timestamp => 7,
            Self::LongLong => 8,
            Self::Int24 => 9,
            Self::Date => 10,
            Self::Time => 11,
            Self::DateTime => 12,
            Self::Year => 13,
            Self::Varchar => 15,
            Self::Bit => 16,
            Self::Timestamp2 => 17,
            Self::DateTime2 => 18,
            Self::Time2 => 19,
            Self::Json => 245,
            Self::NewDecimal => 246,
            Self::Enum => 247,
            Self::Set => 248,
            Self::TinyBlob => 249,
            Self::MediumBlob => 250,
            Self::LongBlob => 251,
            Self::Blob => 252,
            Self::VarString => 253,
            Self::String => 254,
            Self::Geometry => 255,
            Self::Other(code) => *code,
        }
    }

    /// Size in bytes of this type's table-map metadata.
    pub fn metadata_len(&self) -> usize {
        match self {
            Self::Float
            | Self::Double
            | Self::Blob
            | Self::TinyBlob
            | Self::MediumBlob
            | Self::LongBlob
            | Self::Json
            | Self::Geometry
            | Self::Time2
            | Self::DateTime2
            | Self::Timestamp2 => 1,
            Self::Varchar
            | Self::VarString
            | Self::Bit
            | Self::NewDecimal
            | Self::String
            | Self::Enum
            | Self::Set => 2,
            _ => 0,
        }
    }
}

/// One column of a table map.
///
/// `metadata` packs the per-type table-map metadata into a `u16`:
///
/// | type                     | layout                               |
/// |--------------------------|--------------------------------------|
/// | varchar / var_string     | max byte length                      |
/// | string / enum / set      | `real_type << 8 \| length`           |
/// | new_decimal              | `precision << 8 \| scale`            |
/// | bit                      | `bytes << 8 \| bits`                 |
/// | blob / json / geometry   | length-prefix size (1-4)             |
/// | time2 / datetime2 / ts2  | fractional seconds precision         |
/// | float / double           | storage size                         |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub column_type: ColumnType,
    pub metadata: u16,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(column_type: ColumnType, metadata: u16) -> Self {
        Self {
            column_type,
            metadata,
            nullable: true,
        }
    }
}

/// Binlog event header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(CdcError::decode(format!(
                "event header too short: {} bytes",
                data.len()
            )));
        }
        let mut r = ByteReader::new(data);
        Ok(Self {
            timestamp: r.u32_le()?,
            event_type: EventType::from_u8(r.u8()?),
            server_id: r.u32_le()?,
            event_length: r.u32_le()?,
            next_position: r.u32_le()?,
            flags: r.u16_le()?,
        })
    }
}

/// Format description event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    /// Events that follow carry a trailing CRC32
    pub checksum: bool,
}

/// Table map event: table id to schema/table/column layout.
///
/// Valid only for the connection that received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema_name: String,
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
}

/// Table metadata cached per connection epoch.
pub type TableMetadata = TableMapEvent;

/// Rows event (INSERT/UPDATE/DELETE), one change per row in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub table_id: u64,
    pub operation: CdcOp,
    pub column_count: usize,
    pub rows: Vec<RowChangeEvent>,
}

/// Event that advances the stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamControlEvent {
    /// Switch to another binlog file
    Rotate { next_file: String, next_offset: u64 },
    /// Transaction commit marker
    Commit { xid: u64, next_offset: u64 },
}

impl StreamControlEvent {
    pub fn next_file(&self) -> Option<&str> {
        match self {
            Self::Rotate { next_file, .. } => Some(next_file),
            Self::Commit { .. } => None,
        }
    }

    pub fn next_offset(&self) -> u64 {
        match self {
            Self::Rotate { next_offset, .. } | Self::Commit { next_offset, .. } => *next_offset,
        }
    }
}

/// Decoded binlog event
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionEvent),
    TableMap(TableMapEvent),
    Rows(RowsEvent),
    Control(StreamControlEvent),
    Heartbeat,
}

/// A decoded event together with its header.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub header: EventHeader,
    pub event: BinlogEvent,
}

/// Decides, from the table map, whether a row event's rows are decoded.
pub type RowFilter = Arc<dyn Fn(&TableMapEvent) -> bool + Send + Sync>;

/// Binlog decoder with a per-connection table cache
pub struct BinlogDecoder {
    table_cache: HashMap<u64, TableMapEvent>,
    checksum: bool,
    row_filter: Option<RowFilter>,
}

impl Default for BinlogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BinlogDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogDecoder")
            .field("tables", &self.table_cache.len())
            .field("checksum", &self.checksum)
            .field("row_filter", &self.row_filter.is_some())
            .finish()
    }
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self {
            table_cache: HashMap::new(),
            checksum: false,
            row_filter: None,
        }
    }

    /// Expect a trailing CRC32 on every event until the next format
    /// description says otherwise.
    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_row_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = Some(filter);
        self
    }

    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_cache.get(&table_id)
    }

    pub fn table_count(&self) -> usize {
        self.table_cache.len()
    }

    /// Forget every cached table map (new connection epoch).
    pub fn reset(&mut self) {
        self.table_cache.clear();
    }

    /// Decode one event.
    ///
    /// Returns `Ok(None)` for skipped events: unknown type codes and row
    /// events rejected by the row filter. A row event for a table id with no
    /// cached table map is [`CdcError::UnknownTable`].
    pub fn decode(&mut self, data: &[u8]) -> Result<Option<DecodedEvent>> {
        let header = EventHeader::parse(data)?;
        let event_len = header.event_length as usize;
        if event_len < EventHeader::SIZE || data.len() < event_len {
            return Err(CdcError::decode(format!(
                "event length {} inconsistent with {} bytes received",
                event_len,
                data.len()
            )));
        }
        let data = &data[..event_len];
        let body = &data[EventHeader::SIZE..];

        let checksum = if header.event_type == EventType::FormatDescription {
            fde_has_checksum(body)
        } else {
            self.checksum
        };
        let payload = if checksum && body.len() >= 4 {
            &body[..body.len() - 4]
        } else {
            body
        };

        trace!(
            event_type = ?header.event_type,
            len = data.len(),
            checksum,
            "Decoding binlog event"
        );

        let event = match header.event_type {
            EventType::FormatDescription => {
                let event = decode_format_description(payload, checksum)?;
                self.checksum = event.checksum;
                BinlogEvent::FormatDescription(event)
            }
            EventType::TableMap => {
                let event = decode_table_map(payload)?;
                self.table_cache.insert(event.table_id, event.clone());
                BinlogEvent::TableMap(event)
            }
            EventType::Rotate => {
                let mut r = ByteReader::new(payload);
                let next_offset = r.u64_le()?;
                let next_file = String::from_utf8_lossy(r.rest())
                    .trim_end_matches('\0')
                    .to_string();
                BinlogEvent::Control(StreamControlEvent::Rotate {
                    next_file,
                    next_offset,
                })
            }
            EventType::Xid => {
                let xid = ByteReader::new(payload).u64_le()?;
                BinlogEvent::Control(StreamControlEvent::Commit {
                    xid,
                    next_offset: u64::from(header.next_position),
                })
            }
            EventType::Heartbeat => BinlogEvent::Heartbeat,
            event_type => match event_type.row_operation() {
                Some(op) => match self.decode_rows(payload, event_type, op)? {
                    Some(rows) => BinlogEvent::Rows(rows),
                    None => return Ok(None),
                },
                None => {
                    trace!(code = event_type.code(), "Skipping binlog event");
                    return Ok(None);
                }
            },
        };

        Ok(Some(DecodedEvent { header, event }))
    }

    /// Decode a buffer of back-to-back events, using each header's
    /// `event_length` to find the next one.
    pub fn decode_stream(&mut self, mut data: &[u8]) -> Result<Vec<DecodedEvent>> {
        let mut events = Vec::new();
        while !data.is_empty() {
            let header = EventHeader::parse(data)?;
            let len = header.event_length as usize;
            if len < EventHeader::SIZE || len > data.len() {
                return Err(CdcError::decode(format!(
                    "event length {} exceeds {} remaining bytes",
                    len,
                    data.len()
                )));
            }
            if let Some(event) = self.decode(&data[..len])? {
                events.push(event);
            }
            data = &data[len..];
        }
        Ok(events)
    }

    fn decode_rows(
        &self,
        payload: &[u8],
        event_type: EventType,
        op: CdcOp,
    ) -> Result<Option<RowsEvent>> {
        let mut r = ByteReader::new(payload);
        let table_id = r.table_id()?;
        let table = self
            .table_cache
            .get(&table_id)
            .ok_or(CdcError::UnknownTable { table_id })?;

        if let Some(filter) = &self.row_filter {
            if !filter(table) {
                trace!(table = %table.table_name, "Row event rejected by filter");
                return Ok(None);
            }
        }

        let _flags = r.u16_le()?;
        if event_type.is_rows_v2() {
            let extra_len = r.u16_le()? as usize;
            r.skip(extra_len.saturating_sub(2))?;
        }

        let column_count = r.packed_int()? as usize;
        if column_count != table.columns.len() {
            return Err(CdcError::decode(format!(
                "row event for {}.{} has {} columns, table map has {}",
                table.schema_name,
                table.table_name,
                column_count,
                table.columns.len()
            )));
        }
        let bitmap_len = column_count.div_ceil(8);
        let present = r.bytes(bitmap_len)?;
        let present_after = if op == CdcOp::Update {
            r.bytes(bitmap_len)?
        } else {
            present
        };

        let mut rows = Vec::new();
        while r.has_remaining() {
            let start = r.position();
            let (before, after) = match op {
                CdcOp::Insert => (Vec::new(), read_image(&mut r, table, present)?),
                CdcOp::Delete => (read_image(&mut r, table, present)?, Vec::new()),
                CdcOp::Update => {
                    let before = read_image(&mut r, table, present)?;
                    let after = read_image(&mut r, table, present_after)?;
                    (before, after)
                }
            };
            if r.position() == start {
                return Err(CdcError::decode("row image consumed no bytes"));
            }
            rows.push(RowChangeEvent {
                schema: table.schema_name.clone(),
                table: table.table_name.clone(),
                operation: op,
                before,
                after,
            });
        }

        debug!(
            table = %table.table_name,
            op = %op,
            rows = rows.len(),
            "Decoded row event"
        );

        Ok(Some(RowsEvent {
            table_id,
            operation: op,
            column_count,
            rows,
        }))
    }
}

/// Trailing CRC32 on a format description event.
///
/// Layout: binlog_version(2) server_version(50) create_timestamp(4)
/// header_length(1) post_header_lengths(n) checksum_alg(1) [crc32(4)].
fn fde_has_checksum(body: &[u8]) -> bool {
    const FIXED: usize = 2 + 50 + 4 + 1;
    if body.len() < FIXED + 5 {
        return false;
    }
    let version = String::from_utf8_lossy(&body[2..52]);
    mysql_version_has_checksum(version.trim_end_matches('\0')) && body[body.len() - 5] == 1
}

/// Checksums exist from MySQL 5.6.1 and MariaDB 5.3.
fn mysql_version_has_checksum(version: &str) -> bool {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts
        .next()
        .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    if major == 0 {
        // Unparseable: assume a modern server
        return true;
    }
    if version.contains("MariaDB") {
        return major > 5 || (major == 5 && minor >= 3);
    }
    major > 5 || (major == 5 && minor >= 6)
}

fn decode_format_description(payload: &[u8], checksum: bool) -> Result<FormatDescriptionEvent> {
    let mut r = ByteReader::new(payload);
    let binlog_version = r.u16_le()?;
    let server_version = String::from_utf8_lossy(r.bytes(50)?)
        .trim_end_matches('\0')
        .to_string();
    let create_timestamp = r.u32_le()?;
    let header_length = r.u8()?;

    debug!(
        binlog_version,
        server = %server_version,
        checksum,
        "Format description"
    );

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        create_timestamp,
        header_length,
        checksum,
    })
}

fn decode_table_map(payload: &[u8]) -> Result<TableMapEvent> {
    let mut r = ByteReader::new(payload);
    let table_id = r.table_id()?;
    let _flags = r.u16_le()?;
    let schema_name = r.len_prefixed_str()?;
    r.skip(1)?;
    let table_name = r.len_prefixed_str()?;
    r.skip(1)?;

    let column_count = r.packed_int()? as usize;
    let types: Vec<ColumnType> = r
        .bytes(column_count)?
        .iter()
        .map(|b| ColumnType::from_u8(*b))
        .collect();

    let metadata_len = r.packed_int()? as usize;
    let mut meta = ByteReader::new(r.bytes(metadata_len)?);
    let mut columns = Vec::with_capacity(column_count);
    for column_type in types {
        let metadata = match column_type.metadata_len() {
            0 => 0,
            1 => u16::from(meta.u8()?),
            // string/enum/set and decimal/bit are two single bytes, high first
            _ if matches!(
                column_type,
                ColumnType::String | ColumnType::Enum | ColumnType::Set | ColumnType::NewDecimal
            ) =>
            {
                meta.uint_be(2)? as u16
            }
            _ => meta.u16_le()?,
        };
        columns.push(ColumnDef {
            column_type,
            metadata,
            nullable: true,
        });
    }

    // Null bitmap is absent on some very old servers
    if r.remaining() >= column_count.div_ceil(8) {
        let nulls = r.bytes(column_count.div_ceil(8))?;
        for (idx, column) in columns.iter_mut().enumerate() {
            column.nullable = is_bit_set(nulls, idx);
        }
    }

    Ok(TableMapEvent {
        table_id,
        schema_name,
        table_name,
        columns,
    })
}

/// One row image: null bitmap over present columns, then the values.
fn read_image(
    r: &mut ByteReader<'_>,
    table: &TableMapEvent,
    present: &[u8],
) -> Result<Vec<ColumnValue>> {
    let present_count = count_set_bits(present);
    let nulls = r.bytes(present_count.div_ceil(8))?;
    let mut values = Vec::with_capacity(present_count);
    let mut null_idx = 0;
    for (idx, column) in table.columns.iter().enumerate() {
        if !is_bit_set(present, idx) {
            continue;
        }
        if is_bit_set(nulls, null_idx) {
            values.push(ColumnValue::Null);
        } else {
            values.push(decode_value(r, column)?);
        }
        null_idx += 1;
    }
    Ok(values)
}

/// Effective (type, metadata) for STRING columns that are really ENUM/SET.
pub(crate) fn resolve_string_type(column: &ColumnDef) -> (ColumnType, u16) {
    if column.column_type != ColumnType::String {
        return (column.column_type, column.metadata);
    }
    let real_type = (column.metadata >> 8) as u8;
    if real_type == ColumnType::Enum.code() || real_type == ColumnType::Set.code() {
        (ColumnType::from_u8(real_type), column.metadata & 0xFF)
    } else {
        // Lengths above 255 steal two bits from the type byte
        let max_len = (((column.metadata >> 4) & 0x300) ^ 0x300) + (column.metadata & 0xFF);
        (ColumnType::String, max_len)
    }
}

fn decode_value(r: &mut ByteReader<'_>, column: &ColumnDef) -> Result<ColumnValue> {
    let (column_type, metadata) = resolve_string_type(column);
    let value = match column_type {
        ColumnType::Tiny => ColumnValue::Int(i64::from(r.i8()?)),
        ColumnType::Short => ColumnValue::Int(i64::from(r.i16_le()?)),
        ColumnType::Int24 => {
            let raw = r.uint_le(3)? as u32;
            // sign-extend from 24 bits
            ColumnValue::Int(i64::from(((raw << 8) as i32) >> 8))
        }
        ColumnType::Long => ColumnValue::Int(i64::from(r.i32_le()?)),
        ColumnType::LongLong => ColumnValue::Int(r.i64_le()?),
        ColumnType::Float => ColumnValue::Float(r.f32_le()?),
        ColumnType::Double => ColumnValue::Double(r.f64_le()?),
        ColumnType::NewDecimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            ColumnValue::Decimal(decode_decimal(r, precision, scale)?)
        }
        ColumnType::Year => match r.u8()? {
            0 => ColumnValue::Year(0),
            y => ColumnValue::Year(1900 + u16::from(y)),
        },
        ColumnType::Date => {
            let packed = r.uint_le(3)? as u32;
            ColumnValue::Date {
                year: ((packed >> 9) & 0x7FFF) as u16,
                month: ((packed >> 5) & 0x0F) as u8,
                day: (packed & 0x1F) as u8,
            }
        }
        ColumnType::Time => {
            let raw = r.uint_le(3)? as u32;
            let signed = ((raw << 8) as i32) >> 8;
            let packed = signed.unsigned_abs();
            ColumnValue::Time {
                negative: signed < 0,
                hours: (packed / 10000) as u16,
                minutes: ((packed / 100) % 100) as u8,
                seconds: (packed % 100) as u8,
                microseconds: 0,
            }
        }
        ColumnType::Time2 => decode_time2(r, metadata as u8)?,
        ColumnType::DateTime => {
            let packed = r.u64_le()?;
            ColumnValue::DateTime {
                year: (packed / 10_000_000_000) as u16,
                month: ((packed / 100_000_000) % 100) as u8,
                day: ((packed / 1_000_000) % 100) as u8,
                hour: ((packed / 10_000) % 100) as u8,
                minute: ((packed / 100) % 100) as u8,
                second: (packed % 100) as u8,
                microsecond: 0,
            }
        }
        ColumnType::DateTime2 => {
            let packed = r.uint_be(5)?;
            let microsecond = read_fraction(r, metadata as u8)?;
            let year_month = (packed >> 22) & 0x1FFFF;
            ColumnValue::DateTime {
                year: (year_month / 13) as u16,
                month: (year_month % 13) as u8,
                day: ((packed >> 17) & 0x1F) as u8,
                hour: ((packed >> 12) & 0x1F) as u8,
                minute: ((packed >> 6) & 0x3F) as u8,
                second: (packed & 0x3F) as u8,
                microsecond,
            }
        }
        ColumnType::Timestamp => ColumnValue::Timestamp {
            seconds: r.u32_le()?,
            microseconds: 0,
        },
        ColumnType::Timestamp2 => ColumnValue::Timestamp {
            seconds: r.uint_be(4)? as u32,
            microseconds: read_fraction(r, metadata as u8)?,
        },
        ColumnType::Varchar | ColumnType::VarString | ColumnType::String => {
            let len = if metadata < 256 {
                r.u8()? as usize
            } else {
                r.u16_le()? as usize
            };
            ColumnValue::String(String::from_utf8_lossy(r.bytes(len)?).into_owned())
        }
        ColumnType::Enum => ColumnValue::Enum(r.uint_le(usize::from(metadata.clamp(1, 2)))? as u16),
        ColumnType::Set => ColumnValue::Set(r.uint_le(usize::from(metadata.clamp(1, 8)))?),
        ColumnType::Bit => {
            let nbits = usize::from(metadata >> 8) * 8 + usize::from(metadata & 0xFF);
            ColumnValue::Bit(r.bytes(nbits.div_ceil(8))?.to_vec())
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry => {
            let len = r.uint_le(usize::from(metadata.clamp(1, 4)))? as usize;
            ColumnValue::Bytes(r.bytes(len)?.to_vec())
        }
        ColumnType::Json => {
            let len = r.uint_le(usize::from(metadata.clamp(1, 4)))? as usize;
            ColumnValue::Json(decode_json(r.bytes(len)?))
        }
        ColumnType::Null => ColumnValue::Null,
        ColumnType::Other(code) => {
            return Err(CdcError::decode(format!(
                "unsupported column type {}",
                code
            )))
        }
    };
    Ok(value)
}

/// Fractional seconds for time2/datetime2/timestamp2, in microseconds.
///
/// Precision 1-2 uses one byte (hundredths), 3-4 two bytes (1/10000s),
/// 5-6 three bytes (microseconds).
fn read_fraction(r: &mut ByteReader<'_>, fsp: u8) -> Result<u32> {
    let bytes = usize::from(fsp.min(6)).div_ceil(2);
    if bytes == 0 {
        return Ok(0);
    }
    let value = r.uint_be(bytes)? as u32;
    Ok(value * 10u32.pow(6 - 2 * bytes as u32))
}

pub(crate) const TIMEF_INT_OFS: i64 = 0x800000;
pub(crate) const TIMEF_OFS: i64 = 0x8000_0000_0000;

fn decode_time2(r: &mut ByteReader<'_>, fsp: u8) -> Result<ColumnValue> {
    let packed: i64 = match fsp {
        0 => (r.uint_be(3)? as i64 - TIMEF_INT_OFS) << 24,
        1 | 2 => {
            let mut int_part = r.uint_be(3)? as i64 - TIMEF_INT_OFS;
            let mut frac = i64::from(r.i8()?);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = r.uint_be(3)? as i64 - TIMEF_INT_OFS;
            let mut frac = i64::from(r.uint_be(2)? as u16 as i16);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        _ => r.uint_be(6)? as i64 - TIMEF_OFS,
    };

    let negative = packed < 0;
    let magnitude = packed.unsigned_abs();
    let hms = magnitude >> 24;
    Ok(ColumnValue::Time {
        negative,
        hours: ((hms >> 12) & 0x3FF) as u16,
        minutes: ((hms >> 6) & 0x3F) as u8,
        seconds: (hms & 0x3F) as u8,
        microseconds: (magnitude & 0xFF_FFFF) as u32,
    })
}

pub(crate) const DIGITS_PER_WORD: usize = 9;
pub(crate) const DIGITS_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// Storage size of a NEWDECIMAL(precision, scale).
pub(crate) fn decimal_size(precision: usize, scale: usize) -> usize {
    let int_digits = precision.saturating_sub(scale);
    DIGITS_TO_BYTES[int_digits % DIGITS_PER_WORD]
        + (int_digits / DIGITS_PER_WORD) * 4
        + (scale / DIGITS_PER_WORD) * 4
        + DIGITS_TO_BYTES[scale % DIGITS_PER_WORD]
}

fn decode_decimal(r: &mut ByteReader<'_>, precision: usize, scale: usize) -> Result<String> {
    if scale > precision {
        return Err(CdcError::decode(format!(
            "decimal scale {} exceeds precision {}",
            scale, precision
        )));
    }
    let int_digits = precision - scale;
    let mut bytes = r.bytes(decimal_size(precision, scale))?.to_vec();
    if bytes.is_empty() {
        return Ok("0".to_string());
    }

    // Sign bit is stored inverted; negative values are one's complement
    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        bytes.iter_mut().for_each(|b| *b = !*b);
    }

    let mut d = ByteReader::new(&bytes);
    let mut int_part = String::new();
    let int_leftover = int_digits % DIGITS_PER_WORD;
    if int_leftover > 0 {
        let v = d.uint_be(DIGITS_TO_BYTES[int_leftover])?;
        if v > 0 {
            int_part.push_str(&v.to_string());
        }
    }
    for _ in 0..int_digits / DIGITS_PER_WORD {
        let v = d.uint_be(4)?;
        if int_part.is_empty() {
            if v > 0 {
                int_part.push_str(&v.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", v));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut out = String::with_capacity(precision + 2);
    if negative {
        out.push('-');
    }
    out.push_str(&int_part);
    if scale > 0 {
        out.push('.');
        for _ in 0..scale / DIGITS_PER_WORD {
            out.push_str(&format!("{:09}", d.uint_be(4)?));
        }
        let frac_leftover = scale % DIGITS_PER_WORD;
        if frac_leftover > 0 {
            let v = d.uint_be(DIGITS_TO_BYTES[frac_leftover])?;
            out.push_str(&format!("{:0width$}", v, width = frac_leftover));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::builder::EventBuilder;

    fn orders_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new(ColumnType::Long, 0),
            ColumnDef::new(ColumnType::Varchar, 255),
        ]
    }

    #[test]
    fn test_event_type_from_u8() {
        assert_eq!(EventType::from_u8(4), EventType::Rotate);
        assert_eq!(EventType::from_u8(19), EventType::TableMap);
        assert_eq!(EventType::from_u8(30), EventType::WriteRowsV2);
        assert_eq!(EventType::from_u8(200), EventType::Other(200));
        assert_eq!(EventType::from_u8(31).code(), 31);
    }

    #[test]
    fn test_row_operation() {
        assert_eq!(EventType::WriteRowsV1.row_operation(), Some(CdcOp::Insert));
        assert_eq!(EventType::UpdateRowsV2.row_operation(), Some(CdcOp::Update));
        assert_eq!(EventType::DeleteRowsV2.row_operation(), Some(CdcOp::Delete));
        assert!(!EventType::TableMap.is_row_event());
        assert!(!EventType::Xid.is_row_event());
    }

    #[test]
    fn test_column_type_roundtrip_code() {
        for code in [1u8, 3, 8, 15, 17, 18, 19, 245, 246, 252, 254] {
            assert_eq!(ColumnType::from_u8(code).code(), code);
        }
        assert_eq!(ColumnType::from_u8(0), ColumnType::Other(0));
    }

    #[test]
    fn test_event_header_parse_too_short() {
        assert!(EventHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_event_header_parse() {
        let mut data = Vec::new();
        data.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        data.push(16);
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&27u32.to_le_bytes());
        data.extend_from_slice(&1234u32.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        let header = EventHeader::parse(&data).unwrap();
        assert_eq!(header.event_type, EventType::Xid);
        assert_eq!(header.server_id, 7);
        assert_eq!(header.event_length, 27);
        assert_eq!(header.next_position, 1234);
    }

    #[test]
    fn test_table_map_cached() {
        let builder = EventBuilder::new();
        let mut decoder = BinlogDecoder::new();
        let event = decoder
            .decode(&builder.table_map(5, "shop", "orders", &orders_columns()))
            .unwrap()
            .unwrap();
        match event.event {
            BinlogEvent::TableMap(tm) => {
                assert_eq!(tm.table_id, 5);
                assert_eq!(tm.schema_name, "shop");
                assert_eq!(tm.table_name, "orders");
                assert_eq!(tm.columns.len(), 2);
                assert_eq!(tm.columns[1].metadata, 255);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(decoder.table(5).unwrap().table_name, "orders");
        decoder.reset();
        assert!(decoder.table(5).is_none());
    }

    #[test]
    fn test_unknown_table_is_error() {
        let builder = EventBuilder::new();
        let mut decoder = BinlogDecoder::new();
        let rows = builder.write_rows(9, &orders_columns(), &[vec![1i64.into(), "a".into()]]);
        let err = decoder.decode(&rows).unwrap_err();
        assert!(matches!(err, CdcError::UnknownTable { table_id: 9 }));
    }

    #[test]
    fn test_unknown_event_type_skipped() {
        let builder = EventBuilder::new();
        let mut decoder = BinlogDecoder::new();
        assert!(decoder.decode(&builder.raw(99, &[1, 2, 3, 4])).unwrap().is_none());
    }

    #[test]
    fn test_decode_stream_skips_exact_length() {
        let builder = EventBuilder::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&builder.raw(99, &[0xAA; 13]));
        stream.extend_from_slice(&builder.rotate("log.000002", 500));
        let mut decoder = BinlogDecoder::new();
        let events = decoder.decode_stream(&stream).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event,
            BinlogEvent::Control(StreamControlEvent::Rotate {
                next_file: "log.000002".into(),
                next_offset: 500
            })
        );
    }

    #[test]
    fn test_row_filter_skips_event() {
        let builder = EventBuilder::new();
        let mut decoder = BinlogDecoder::new()
            .with_row_filter(Arc::new(|tm: &TableMapEvent| tm.table_name != "orders"));
        decoder
            .decode(&builder.table_map(5, "shop", "orders", &orders_columns()))
            .unwrap();
        // Row bytes are garbage; the filter must reject before decoding them
        let mut rows = builder.write_rows(5, &orders_columns(), &[vec![1i64.into(), "a".into()]]);
        let len = rows.len();
        rows[len - 3] = 0xFF;
        rows[len - 2] = 0xFF;
        assert!(decoder.decode(&rows).unwrap().is_none());
    }

    #[test]
    fn test_all_rows_decoded() {
        let builder = EventBuilder::new();
        let mut decoder = BinlogDecoder::new();
        decoder
            .decode(&builder.table_map(5, "shop", "orders", &orders_columns()))
            .unwrap();
        let event = decoder
            .decode(&builder.write_rows(
                5,
                &orders_columns(),
                &[
                    vec![1i64.into(), "a".into()],
                    vec![2i64.into(), "b".into()],
                    vec![3i64.into(), ColumnValue::Null],
                ],
            ))
            .unwrap()
            .unwrap();
        let BinlogEvent::Rows(rows) = event.event else {
            panic!("expected rows");
        };
        assert_eq!(rows.rows.len(), 3);
        assert_eq!(rows.rows[2].after, vec![ColumnValue::Int(3), ColumnValue::Null]);
    }

    #[test]
    fn test_update_and_delete_images() {
        let builder = EventBuilder::new();
        let mut decoder = BinlogDecoder::new();
        decoder
            .decode(&builder.table_map(5, "shop", "orders", &orders_columns()))
            .unwrap();

        let update = decoder
            .decode(&builder.update_rows(
                5,
                &orders_columns(),
                &[(vec![1i64.into(), "a".into()], vec![1i64.into(), "b".into()])],
            ))
            .unwrap()
            .unwrap();
        let BinlogEvent::Rows(update) = update.event else {
            panic!("expected rows");
        };
        assert_eq!(update.operation, CdcOp::Update);
        assert_eq!(update.rows[0].before[1], ColumnValue::from("a"));
        assert_eq!(update.rows[0].after[1], ColumnValue::from("b"));

        let delete = decoder
            .decode(&builder.delete_rows(5, &orders_columns(), &[vec![1i64.into(), "b".into()]]))
            .unwrap()
            .unwrap();
        let BinlogEvent::Rows(delete) = delete.event else {
            panic!("expected rows");
        };
        assert_eq!(delete.rows[0].operation, CdcOp::Delete);
        assert!(delete.rows[0].after.is_empty());
        assert_eq!(delete.rows[0].before.len(), 2);
    }

    #[test]
    fn test_truncated_row_is_decode_error() {
        let builder = EventBuilder::new();
        let mut decoder = BinlogDecoder::new();
        decoder
            .decode(&builder.table_map(5, "shop", "orders", &orders_columns()))
            .unwrap();
        let rows = builder.write_rows(5, &orders_columns(), &[vec![1i64.into(), "abc".into()]]);
        // Cut the varchar short but keep the header length consistent
        let truncated = builder.raw(30, &rows[EventHeader::SIZE..rows.len() - 2]);
        let err = decoder.decode(&truncated).unwrap_err();
        assert!(matches!(err, CdcError::Decode(_)));
    }

    #[test]
    fn test_xid_uses_header_next_position() {
        let builder = EventBuilder::new().with_next_position(4321);
        let mut decoder = BinlogDecoder::new();
        let event = decoder.decode(&builder.xid(77)).unwrap().unwrap();
        assert_eq!(
            event.event,
            BinlogEvent::Control(StreamControlEvent::Commit {
                xid: 77,
                next_offset: 4321
            })
        );
    }

    #[test]
    fn test_checksum_stripped() {
        let builder = EventBuilder::new().with_checksum(true);
        let mut decoder = BinlogDecoder::new().with_checksum(true);
        let event = decoder.decode(&builder.rotate("log.000009", 4)).unwrap().unwrap();
        assert_eq!(
            event.event,
            BinlogEvent::Control(StreamControlEvent::Rotate {
                next_file: "log.000009".into(),
                next_offset: 4
            })
        );
    }

    #[test]
    fn test_format_description_enables_checksum() {
        let builder = EventBuilder::new();
        let mut decoder = BinlogDecoder::new();
        let event = decoder
            .decode(&builder.format_description("8.0.36", true))
            .unwrap()
            .unwrap();
        match event.event {
            BinlogEvent::FormatDescription(fde) => {
                assert!(fde.checksum);
                assert_eq!(fde.server_version, "8.0.36");
            }
            other => panic!("unexpected event {:?}", other),
        }
        // Subsequent events carry the trailing CRC
        let rotate = EventBuilder::new()
            .with_checksum(true)
            .rotate("log.000003", 4);
        assert!(decoder.decode(&rotate).unwrap().is_some());
    }

    #[test]
    fn test_mysql_version_has_checksum() {
        assert!(mysql_version_has_checksum("8.0.35-0ubuntu0.22.04.1-log"));
        assert!(mysql_version_has_checksum("5.6.10"));
        assert!(!mysql_version_has_checksum("5.5.62"));
        assert!(mysql_version_has_checksum("10.6.12-MariaDB"));
        assert!(mysql_version_has_checksum("garbage"));
    }

    #[test]
    fn test_decimal_size() {
        assert_eq!(decimal_size(10, 2), 5);
        assert_eq!(decimal_size(18, 9), 8);
        assert_eq!(decimal_size(1, 0), 1);
    }
}
