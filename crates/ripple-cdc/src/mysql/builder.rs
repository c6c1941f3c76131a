//! Binlog event encoder
//!
//! Produces wire-format events (header, body, optional CRC trailer) that
//! [`BinlogDecoder`](super::decoder::BinlogDecoder) accepts. Used to drive the
//! decoder and capture pipeline without a live server.
//!
//! Row values that do not fit their column's type are written as NULL.

use super::decoder::{
    decimal_size, resolve_string_type, ColumnDef, ColumnType, EventHeader, EventType,
    DIGITS_PER_WORD, DIGITS_TO_BYTES, TIMEF_INT_OFS, TIMEF_OFS,
};
use super::json::encode_json;
use crate::common::{CdcOp, ColumnValue};

#[derive(Debug, Clone)]
pub struct EventBuilder {
    server_id: u32,
    timestamp: u32,
    next_position: u32,
    checksum: bool,
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuilder {
    pub fn new() -> Self {
        Self {
            server_id: 1,
            timestamp: 1_700_000_000,
            next_position: 0,
            checksum: false,
        }
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// `next_position` written into every header.
    pub fn with_next_position(mut self, next_position: u32) -> Self {
        self.next_position = next_position;
        self
    }

    /// Append a 4-byte checksum trailer to every event.
    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    /// Frame an arbitrary body under the given type code.
    pub fn raw(&self, type_code: u8, body: &[u8]) -> Vec<u8> {
        self.frame(EventType::from_u8(type_code), body, self.checksum)
    }

    pub fn format_description(&self, server_version: &str, checksum: bool) -> Vec<u8> {
        let mut body = Vec::with_capacity(100);
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut version = [0u8; 50];
        let len = server_version.len().min(50);
        version[..len].copy_from_slice(&server_version.as_bytes()[..len]);
        body.extend_from_slice(&version);
        body.extend_from_slice(&self.timestamp.to_le_bytes());
        body.push(EventHeader::SIZE as u8);
        // post-header lengths, one per event type
        body.extend_from_slice(&[0u8; 40]);
        body.push(u8::from(checksum));
        self.frame(EventType::FormatDescription, &body, checksum)
    }

    pub fn table_map(
        &self,
        table_id: u64,
        schema: &str,
        table: &str,
        columns: &[ColumnDef],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        write_uint_le(&mut body, table_id, 6);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.push(schema.len() as u8);
        body.extend_from_slice(schema.as_bytes());
        body.push(0);
        body.push(table.len() as u8);
        body.extend_from_slice(table.as_bytes());
        body.push(0);

        write_packed_int(&mut body, columns.len() as u64);
        body.extend(columns.iter().map(|c| c.column_type.code()));

        let mut metadata = Vec::new();
        for column in columns {
            match column.column_type.metadata_len() {
                0 => {}
                1 => metadata.push(column.metadata as u8),
                _ if matches!(
                    column.column_type,
                    ColumnType::String | ColumnType::Enum | ColumnType::Set | ColumnType::NewDecimal
                ) =>
                {
                    metadata.extend_from_slice(&column.metadata.to_be_bytes())
                }
                _ => metadata.extend_from_slice(&column.metadata.to_le_bytes()),
            }
        }
        write_packed_int(&mut body, metadata.len() as u64);
        body.extend_from_slice(&metadata);

        let mut nulls = vec![0u8; columns.len().div_ceil(8)];
        for (idx, column) in columns.iter().enumerate() {
            if column.nullable {
                nulls[idx / 8] |= 1 << (idx % 8);
            }
        }
        body.extend_from_slice(&nulls);

        self.frame(EventType::TableMap, &body, self.checksum)
    }

    /// WRITE_ROWS_EVENT v2 with every column present.
    pub fn write_rows(
        &self,
        table_id: u64,
        columns: &[ColumnDef],
        rows: &[Vec<ColumnValue>],
    ) -> Vec<u8> {
        let images: Vec<(&[ColumnValue], &[ColumnValue])> =
            rows.iter().map(|r| (&[][..], r.as_slice())).collect();
        self.rows_event(CdcOp::Insert, table_id, columns, &images)
    }

    /// UPDATE_ROWS_EVENT v2 with every column present in both images.
    pub fn update_rows(
        &self,
        table_id: u64,
        columns: &[ColumnDef],
        rows: &[(Vec<ColumnValue>, Vec<ColumnValue>)],
    ) -> Vec<u8> {
        let images: Vec<(&[ColumnValue], &[ColumnValue])> = rows
            .iter()
            .map(|(before, after)| (before.as_slice(), after.as_slice()))
            .collect();
        self.rows_event(CdcOp::Update, table_id, columns, &images)
    }

    /// DELETE_ROWS_EVENT v2 with every column present.
    pub fn delete_rows(
        &self,
        table_id: u64,
        columns: &[ColumnDef],
        rows: &[Vec<ColumnValue>],
    ) -> Vec<u8> {
        let images: Vec<(&[ColumnValue], &[ColumnValue])> =
            rows.iter().map(|r| (r.as_slice(), &[][..])).collect();
        self.rows_event(CdcOp::Delete, table_id, columns, &images)
    }

    pub fn rotate(&self, next_file: &str, next_offset: u64) -> Vec<u8> {
        let mut body = next_offset.to_le_bytes().to_vec();
        body.extend_from_slice(next_file.as_bytes());
        self.frame(EventType::Rotate, &body, self.checksum)
    }

    pub fn xid(&self, xid: u64) -> Vec<u8> {
        self.frame(EventType::Xid, &xid.to_le_bytes(), self.checksum)
    }

    pub fn heartbeat(&self, file: &str) -> Vec<u8> {
        self.frame(EventType::Heartbeat, file.as_bytes(), self.checksum)
    }

    fn rows_event(
        &self,
        op: CdcOp,
        table_id: u64,
        columns: &[ColumnDef],
        images: &[(&[ColumnValue], &[ColumnValue])],
    ) -> Vec<u8> {
        let event_type = match op {
            CdcOp::Insert => EventType::WriteRowsV2,
            CdcOp::Update => EventType::UpdateRowsV2,
            CdcOp::Delete => EventType::DeleteRowsV2,
        };

        let mut body = Vec::new();
        write_uint_le(&mut body, table_id, 6);
        body.extend_from_slice(&0u16.to_le_bytes());
        // v2 extra data: length includes itself
        body.extend_from_slice(&2u16.to_le_bytes());
        write_packed_int(&mut body, columns.len() as u64);

        let mut present = vec![0u8; columns.len().div_ceil(8)];
        for idx in 0..columns.len() {
            present[idx / 8] |= 1 << (idx % 8);
        }
        body.extend_from_slice(&present);
        if op == CdcOp::Update {
            body.extend_from_slice(&present);
        }

        for (before, after) in images {
            match op {
                CdcOp::Insert => write_image(&mut body, columns, after),
                CdcOp::Delete => write_image(&mut body, columns, before),
                CdcOp::Update => {
                    write_image(&mut body, columns, before);
                    write_image(&mut body, columns, after);
                }
            }
        }

        self.frame(event_type, &body, self.checksum)
    }

    fn frame(&self, event_type: EventType, body: &[u8], checksum: bool) -> Vec<u8> {
        let trailer = if checksum { 4 } else { 0 };
        let event_length = (EventHeader::SIZE + body.len() + trailer) as u32;
        let mut out = Vec::with_capacity(event_length as usize);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.push(event_type.code());
        out.extend_from_slice(&self.server_id.to_le_bytes());
        out.extend_from_slice(&event_length.to_le_bytes());
        out.extend_from_slice(&self.next_position.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(body);
        if checksum {
            // Trailer is stripped, never verified
            out.extend_from_slice(&[0u8; 4]);
        }
        out
    }
}

fn write_image(out: &mut Vec<u8>, columns: &[ColumnDef], values: &[ColumnValue]) {
    let encoded: Vec<Option<Vec<u8>>> = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| values.get(idx).and_then(|v| encode_value(column, v)))
        .collect();

    let mut nulls = vec![0u8; columns.len().div_ceil(8)];
    for (idx, value) in encoded.iter().enumerate() {
        if value.is_none() {
            nulls[idx / 8] |= 1 << (idx % 8);
        }
    }
    out.extend_from_slice(&nulls);
    for value in encoded.into_iter().flatten() {
        out.extend_from_slice(&value);
    }
}

fn write_uint_le(out: &mut Vec<u8>, value: u64, n: usize) {
    out.extend_from_slice(&value.to_le_bytes()[..n]);
}

fn write_uint_be(out: &mut Vec<u8>, value: u64, n: usize) {
    out.extend_from_slice(&value.to_be_bytes()[8 - n..]);
}

fn write_packed_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=250 => out.push(value as u8),
        251..=0xFFFF => {
            out.push(252);
            write_uint_le(out, value, 2);
        }
        0x1_0000..=0xFF_FFFF => {
            out.push(253);
            write_uint_le(out, value, 3);
        }
        _ => {
            out.push(254);
            write_uint_le(out, value, 8);
        }
    }
}

fn write_length_prefixed(out: &mut Vec<u8>, data: &[u8], prefix: usize) -> Option<()> {
    let prefix = prefix.clamp(1, 4);
    if prefix < 4 && data.len() >= 1 << (8 * prefix) {
        return None;
    }
    write_uint_le(out, data.len() as u64, prefix);
    out.extend_from_slice(data);
    Some(())
}

fn write_fraction(out: &mut Vec<u8>, fsp: u8, microseconds: u32) {
    let bytes = usize::from(fsp.min(6)).div_ceil(2);
    if bytes > 0 {
        let scaled = microseconds / 10u32.pow(6 - 2 * bytes as u32);
        write_uint_be(out, u64::from(scaled), bytes);
    }
}

/// Wire bytes for one non-NULL value, `None` for NULL or a type mismatch.
fn encode_value(column: &ColumnDef, value: &ColumnValue) -> Option<Vec<u8>> {
    let (column_type, metadata) = resolve_string_type(column);
    let mut out = Vec::new();
    match (column_type, value) {
        (ColumnType::Tiny, ColumnValue::Int(v)) => out.push(*v as i8 as u8),
        (ColumnType::Short, ColumnValue::Int(v)) => {
            out.extend_from_slice(&(*v as i16).to_le_bytes())
        }
        (ColumnType::Int24, ColumnValue::Int(v)) => write_uint_le(&mut out, *v as u64, 3),
        (ColumnType::Long, ColumnValue::Int(v)) => {
            out.extend_from_slice(&(*v as i32).to_le_bytes())
        }
        (ColumnType::LongLong, ColumnValue::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Float, ColumnValue::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Double, ColumnValue::Double(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::NewDecimal, ColumnValue::Decimal(v)) => {
            out = encode_decimal(v, (metadata >> 8) as usize, (metadata & 0xFF) as usize)?
        }
        (ColumnType::Year, ColumnValue::Year(y)) => {
            out.push(if *y == 0 { 0 } else { y.checked_sub(1900)? as u8 })
        }
        (ColumnType::Date, ColumnValue::Date { year, month, day }) => {
            let packed = (u64::from(*year) << 9) | (u64::from(*month) << 5) | u64::from(*day);
            write_uint_le(&mut out, packed, 3);
        }
        (
            ColumnType::Time,
            ColumnValue::Time {
                negative,
                hours,
                minutes,
                seconds,
                ..
            },
        ) => {
            let mut packed =
                i64::from(*hours) * 10000 + i64::from(*minutes) * 100 + i64::from(*seconds);
            if *negative {
                packed = -packed;
            }
            write_uint_le(&mut out, packed as u64, 3);
        }
        (
            ColumnType::Time2,
            ColumnValue::Time {
                negative,
                hours,
                minutes,
                seconds,
                microseconds,
            },
        ) => {
            let hms = (i64::from(*hours) << 12) | (i64::from(*minutes) << 6) | i64::from(*seconds);
            let signed = |v: i64| if *negative { -v } else { v };
            match metadata as u8 {
                0 => write_uint_be(&mut out, (signed(hms) + TIMEF_INT_OFS) as u64, 3),
                fsp @ 1..=4 => {
                    // Negative values with a fraction borrow from the integer part
                    if *negative && *microseconds != 0 {
                        return None;
                    }
                    write_uint_be(&mut out, (signed(hms) + TIMEF_INT_OFS) as u64, 3);
                    write_fraction(&mut out, fsp, *microseconds);
                }
                _ => {
                    let packed = signed((hms << 24) + i64::from(*microseconds));
                    write_uint_be(&mut out, (packed + TIMEF_OFS) as u64, 6);
                }
            }
        }
        (
            ColumnType::DateTime,
            ColumnValue::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                ..
            },
        ) => {
            let packed = u64::from(*year) * 10_000_000_000
                + u64::from(*month) * 100_000_000
                + u64::from(*day) * 1_000_000
                + u64::from(*hour) * 10_000
                + u64::from(*minute) * 100
                + u64::from(*second);
            out.extend_from_slice(&packed.to_le_bytes());
        }
        (
            ColumnType::DateTime2,
            ColumnValue::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                microsecond,
            },
        ) => {
            let year_month = u64::from(*year) * 13 + u64::from(*month);
            let packed = (1u64 << 39)
                | (year_month << 22)
                | (u64::from(*day) << 17)
                | (u64::from(*hour) << 12)
                | (u64::from(*minute) << 6)
                | u64::from(*second);
            write_uint_be(&mut out, packed, 5);
            write_fraction(&mut out, metadata as u8, *microsecond);
        }
        (ColumnType::Timestamp, ColumnValue::Timestamp { seconds, .. }) => {
            out.extend_from_slice(&seconds.to_le_bytes())
        }
        (
            ColumnType::Timestamp2,
            ColumnValue::Timestamp {
                seconds,
                microseconds,
            },
        ) => {
            out.extend_from_slice(&seconds.to_be_bytes());
            write_fraction(&mut out, metadata as u8, *microseconds);
        }
        (
            ColumnType::Varchar | ColumnType::VarString | ColumnType::String,
            ColumnValue::String(s),
        ) => {
            let prefix = if metadata < 256 { 1 } else { 2 };
            write_length_prefixed(&mut out, s.as_bytes(), prefix)?;
        }
        (ColumnType::Enum, ColumnValue::Enum(v)) => {
            write_uint_le(&mut out, u64::from(*v), usize::from(metadata.clamp(1, 2)))
        }
        (ColumnType::Set, ColumnValue::Set(v)) => {
            write_uint_le(&mut out, *v, usize::from(metadata.clamp(1, 8)))
        }
        (ColumnType::Bit, ColumnValue::Bit(bits)) => {
            let nbits = usize::from(metadata >> 8) * 8 + usize::from(metadata & 0xFF);
            if bits.len() != nbits.div_ceil(8) {
                return None;
            }
            out.extend_from_slice(bits);
        }
        (
            ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Geometry,
            ColumnValue::Bytes(data),
        ) => write_length_prefixed(&mut out, data, usize::from(metadata))?,
        (ColumnType::Json, ColumnValue::Json(v)) => {
            write_length_prefixed(&mut out, &encode_json(v), usize::from(metadata))?
        }
        _ => return None,
    }
    Some(out)
}

/// NEWDECIMAL binary form of a plain decimal literal such as `-123.45`.
fn encode_decimal(text: &str, precision: usize, scale: usize) -> Option<Vec<u8>> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (int_str, frac_str) = digits.split_once('.').unwrap_or((digits, ""));
    if !int_str.chars().chain(frac_str.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let int_digits = precision.checked_sub(scale)?;
    let int_str = int_str.trim_start_matches('0');
    if int_str.len() > int_digits || frac_str.len() > scale {
        return None;
    }
    let int_str = format!("{:0>width$}", int_str, width = int_digits);
    let frac_str = format!("{:0<width$}", frac_str, width = scale);

    let mut out = Vec::with_capacity(decimal_size(precision, scale));
    let int_leftover = int_digits % DIGITS_PER_WORD;
    let (head, words) = int_str.split_at(int_leftover);
    if int_leftover > 0 {
        write_uint_be(&mut out, head.parse().ok()?, DIGITS_TO_BYTES[int_leftover]);
    }
    for chunk in words.as_bytes().chunks(DIGITS_PER_WORD) {
        write_uint_be(&mut out, std::str::from_utf8(chunk).ok()?.parse().ok()?, 4);
    }
    for chunk in frac_str.as_bytes().chunks(DIGITS_PER_WORD) {
        let value: u64 = std::str::from_utf8(chunk).ok()?.parse().ok()?;
        let size = if chunk.len() == DIGITS_PER_WORD {
            4
        } else {
            DIGITS_TO_BYTES[chunk.len()]
        };
        write_uint_be(&mut out, value, size);
    }

    if out.is_empty() {
        return Some(out);
    }
    if negative {
        out.iter_mut().for_each(|b| *b = !*b);
    }
    out[0] ^= 0x80;
    Some(out)
}
