//! Binlog event decoding
//!
//! Parses the 19-byte common header and the event bodies this client acts
//! on: FORMAT_DESCRIPTION, ROTATE, QUERY, XID, TABLE_MAP and the
//! WRITE/UPDATE/DELETE_ROWS families (v0, v1, v2). Everything else is
//! skipped once its framing checks out.
//!
//! The decoder is stateful: a FORMAT_DESCRIPTION event must be seen (or a
//! checksum algorithm pre-announced from `SHOW GLOBAL VARIABLES`) before
//! any other event decodes, because post-header lengths and the checksum
//! trailer depend on it.

use crate::error::{ReplicaError, Result};
use crate::schema::TableDescriptor;
use crate::value::{decode_value, ColumnType, Value};
use crate::wire::PacketReader;
use tracing::{debug, trace};

/// Binlog event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Query,
    Stop,
    Rotate,
    FormatDescription,
    Xid,
    TableMap,
    WriteRowsV0,
    UpdateRowsV0,
    DeleteRowsV0,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Heartbeat,
    WriteRowsV2,
    UpdateRowsV2,
    DeleteRowsV2,
    Unknown(u8),
}

impl EventType {
    pub fn from_u8(code: u8) -> Self {
        match code {
            2 => EventType::Query,
            3 => EventType::Stop,
            4 => EventType::Rotate,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            20 => EventType::WriteRowsV0,
            21 => EventType::UpdateRowsV0,
            22 => EventType::DeleteRowsV0,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            27 => EventType::Heartbeat,
            30 => EventType::WriteRowsV2,
            31 => EventType::UpdateRowsV2,
            32 => EventType::DeleteRowsV2,
            other => EventType::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            EventType::Query => 2,
            EventType::Stop => 3,
            EventType::Rotate => 4,
            EventType::FormatDescription => 15,
            EventType::Xid => 16,
            EventType::TableMap => 19,
            EventType::WriteRowsV0 => 20,
            EventType::UpdateRowsV0 => 21,
            EventType::DeleteRowsV0 => 22,
            EventType::WriteRowsV1 => 23,
            EventType::UpdateRowsV1 => 24,
            EventType::DeleteRowsV1 => 25,
            EventType::Heartbeat => 27,
            EventType::WriteRowsV2 => 30,
            EventType::UpdateRowsV2 => 31,
            EventType::DeleteRowsV2 => 32,
            EventType::Unknown(code) => *code,
        }
    }

    pub fn is_row_event(&self) -> bool {
        self.rows_kind().is_some()
    }

    /// Row-event family and version, if this is a row event.
    pub fn rows_kind(&self) -> Option<(RowsKind, u8)> {
        match self {
            EventType::WriteRowsV0 => Some((RowsKind::Write, 0)),
            EventType::UpdateRowsV0 => Some((RowsKind::Update, 0)),
            EventType::DeleteRowsV0 => Some((RowsKind::Delete, 0)),
            EventType::WriteRowsV1 => Some((RowsKind::Write, 1)),
            EventType::UpdateRowsV1 => Some((RowsKind::Update, 1)),
            EventType::DeleteRowsV1 => Some((RowsKind::Delete, 1)),
            EventType::WriteRowsV2 => Some((RowsKind::Write, 2)),
            EventType::UpdateRowsV2 => Some((RowsKind::Update, 2)),
            EventType::DeleteRowsV2 => Some((RowsKind::Delete, 2)),
            _ => None,
        }
    }
}

/// Common 19-byte event header.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    /// Offset of the byte following this event in the current log
    /// (zero for some artificial events)
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(data);
        Ok(Self {
            timestamp: r.read_u32()?,
            event_type: EventType::from_u8(r.read_u8()?),
            server_id: r.read_u32()?,
            event_length: r.read_u32()?,
            next_position: r.read_u32()?,
            flags: r.read_u16()?,
        })
    }
}

/// Binlog checksum algorithm announced by the FORMAT_DESCRIPTION event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlg {
    #[default]
    Off,
    Crc32,
    Unknown(u8),
}

impl ChecksumAlg {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ChecksumAlg::Off,
            1 => ChecksumAlg::Crc32,
            other => ChecksumAlg::Unknown(other),
        }
    }

    /// Bytes the algorithm appends to every event.
    pub fn trailer_len(&self) -> usize {
        match self {
            ChecksumAlg::Off => 0,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub common_header_len: u8,
    /// Post-header length per event type, indexed by `type_code - 1`
    pub post_header_lengths: Vec<u8>,
    pub checksum_alg: ChecksumAlg,
}

impl FormatDescriptionEvent {
    pub fn post_header_len(&self, event_type: EventType) -> Option<u8> {
        self.post_header_lengths
            .get(event_type.code() as usize - 1)
            .copied()
    }
}

#[derive(Debug, Clone)]
pub struct RotateEvent {
    pub position: u64,
    pub next_log: String,
}

#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub query: String,
}

impl QueryEvent {
    /// Transaction-start marker for non-XA storage engines.
    pub fn is_begin(&self) -> bool {
        self.query.eq_ignore_ascii_case("BEGIN")
    }

    /// Statements that can invalidate cached table layouts.
    pub fn is_schema_change(&self) -> bool {
        let upper = self.query.to_uppercase();
        upper.contains("ALTER TABLE")
            || upper.contains("DROP TABLE")
            || upper.contains("CREATE TABLE")
            || upper.contains("TRUNCATE")
            || upper.contains("RENAME TABLE")
    }
}

#[derive(Debug, Clone)]
pub struct XidEvent {
    pub xid: u64,
}

/// TABLE_MAP: the wire-side column layout for a live table id.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub database: String,
    pub table: String,
    pub column_count: usize,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

impl TableMapEvent {
    pub fn nullable(&self, column: usize) -> bool {
        bit_set(&self.null_bitmap, column)
    }
}

/// Row-event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// A parsed rows event with its row images still in wire form; images are
/// decoded against a table descriptor with [`decode_rows`].
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub kind: RowsKind,
    pub version: u8,
    pub table_id: u64,
    pub flags: u16,
    pub column_count: usize,
    /// Columns present in the (single or before) image
    pub present_before: Vec<u8>,
    /// Columns present in the after image (UPDATE only)
    pub present_after: Option<Vec<u8>>,
    rows_data: Vec<u8>,
}

/// One decoded row change. Image vectors are aligned to the table's column
/// count; `None` marks a column absent from the image, `Some(Value::Null)`
/// an SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPair {
    pub before: Option<Vec<Option<Value>>>,
    pub after: Option<Vec<Option<Value>>>,
}

/// A decoded binlog event.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionEvent),
    Rotate(RotateEvent),
    Query(QueryEvent),
    Xid(XidEvent),
    TableMap(TableMapEvent),
    Rows(RowsEvent),
    Heartbeat,
    Stop,
    /// Correctly framed event this client does not act on
    Skipped(EventType),
}

/// Stateful binlog event decoder.
#[derive(Debug, Default)]
pub struct BinlogEventDecoder {
    fde: Option<FormatDescriptionEvent>,
    checksum: ChecksumAlg,
}

impl BinlogEventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the checksum algorithm learned from
    /// `SHOW GLOBAL VARIABLES LIKE 'binlog_checksum'`; the dump stream's
    /// first events (artificial ROTATE) arrive before the FDE announces it.
    pub fn set_checksum(&mut self, alg: ChecksumAlg) {
        self.checksum = alg;
    }

    pub fn checksum(&self) -> ChecksumAlg {
        self.checksum
    }

    pub fn format_description(&self) -> Option<&FormatDescriptionEvent> {
        self.fde.as_ref()
    }

    /// Decode one complete event (header + body).
    pub fn decode(&mut self, data: &[u8]) -> Result<(EventHeader, BinlogEvent)> {
        if data.len() < EventHeader::SIZE {
            return Err(ReplicaError::malformed(format!(
                "event of {} bytes is shorter than the common header",
                data.len()
            )));
        }
        let header = EventHeader::parse(data)?;
        if header.event_length as usize != data.len() {
            return Err(ReplicaError::malformed(format!(
                "event length {} does not match frame of {} bytes",
                header.event_length,
                data.len()
            )));
        }

        let body = &data[EventHeader::SIZE..];
        trace!(
            event_type = ?header.event_type,
            len = body.len(),
            next_position = header.next_position,
            "decoding binlog event"
        );

        // FDE carries its own checksum description and is parsed whole;
        // ROTATE may legitimately precede it in a dump stream.
        let event = match header.event_type {
            EventType::FormatDescription => {
                let fde = parse_format_description(body)?;
                self.checksum = fde.checksum_alg;
                debug!(
                    binlog_version = fde.binlog_version,
                    server_version = %fde.server_version,
                    checksum = ?fde.checksum_alg,
                    "binlog format description"
                );
                self.fde = Some(fde.clone());
                BinlogEvent::FormatDescription(fde)
            }
            EventType::Rotate => BinlogEvent::Rotate(parse_rotate(self.strip_checksum(body)?)?),
            other => {
                if self.fde.is_none() {
                    return Err(ReplicaError::protocol(format!(
                        "{other:?} event before FORMAT_DESCRIPTION"
                    )));
                }
                let body = self.strip_checksum(body)?;
                match other {
                    EventType::Query => BinlogEvent::Query(parse_query(body)?),
                    EventType::Xid => BinlogEvent::Xid(parse_xid(body)?),
                    EventType::TableMap => {
                        BinlogEvent::TableMap(self.parse_table_map(body)?)
                    }
                    EventType::Heartbeat => BinlogEvent::Heartbeat,
                    EventType::Stop => BinlogEvent::Stop,
                    row_type if row_type.is_row_event() => {
                        BinlogEvent::Rows(self.parse_rows(row_type, body)?)
                    }
                    unknown => BinlogEvent::Skipped(unknown),
                }
            }
        };

        Ok((header, event))
    }

    fn strip_checksum<'a>(&self, body: &'a [u8]) -> Result<&'a [u8]> {
        let trailer = self.checksum.trailer_len();
        if trailer == 0 {
            return Ok(body);
        }
        if body.len() < trailer {
            return Err(ReplicaError::malformed(
                "event shorter than its checksum trailer",
            ));
        }
        Ok(&body[..body.len() - trailer])
    }

    /// Table-id width depends on the event's post-header length: legacy
    /// 6-byte post-headers carry a 4-byte id, modern ones 6 bytes.
    fn table_id_width(&self, event_type: EventType) -> usize {
        match self
            .fde
            .as_ref()
            .and_then(|fde| fde.post_header_len(event_type))
        {
            Some(6) => 4,
            _ => 6,
        }
    }

    fn parse_table_map(&self, body: &[u8]) -> Result<TableMapEvent> {
        let mut r = PacketReader::new(body);

        let table_id = if self.table_id_width(EventType::TableMap) == 4 {
            r.read_u32()? as u64
        } else {
            r.read_u48()?
        };
        let flags = r.read_u16()?;

        let db_len = r.read_u8()? as usize;
        let database = String::from_utf8_lossy(r.read_bytes(db_len)?).into_owned();
        r.skip(1)?;
        let table_len = r.read_u8()? as usize;
        let table = String::from_utf8_lossy(r.read_bytes(table_len)?).into_owned();
        r.skip(1)?;

        let column_count = r.read_lenenc_int()? as usize;
        let mut column_types = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            column_types.push(ColumnType::from_u8(r.read_u8()?)?);
        }

        let metadata_len = r.read_lenenc_int()? as usize;
        if metadata_len > r.remaining() {
            return Err(ReplicaError::length_overflow(format!(
                "column metadata of {metadata_len} bytes exceeds event body"
            )));
        }
        let column_metadata = parse_column_metadata(&column_types, r.read_bytes(metadata_len)?)?;

        let null_bitmap = r.read_bytes(column_count.div_ceil(8))?.to_vec();

        Ok(TableMapEvent {
            table_id,
            flags,
            database,
            table,
            column_count,
            column_types,
            column_metadata,
            null_bitmap,
        })
    }

    fn parse_rows(&self, event_type: EventType, body: &[u8]) -> Result<RowsEvent> {
        let (kind, version) = event_type
            .rows_kind()
            .ok_or_else(|| ReplicaError::UnsupportedEventVersion(event_type.code()))?;

        let mut r = PacketReader::new(body);
        let table_id = if self.table_id_width(event_type) == 4 {
            r.read_u32()? as u64
        } else {
            r.read_u48()?
        };
        let flags = r.read_u16()?;

        if version == 2 {
            let extra_len = r.read_u16()? as usize;
            if extra_len < 2 {
                return Err(ReplicaError::malformed(
                    "rows event v2 extra-data length below header size",
                ));
            }
            r.skip(extra_len - 2)?;
        }

        let column_count = r.read_lenenc_int()? as usize;
        let bitmap_len = column_count.div_ceil(8);
        let present_before = r.read_bytes(bitmap_len)?.to_vec();
        let present_after = if kind == RowsKind::Update {
            Some(r.read_bytes(bitmap_len)?.to_vec())
        } else {
            None
        };

        Ok(RowsEvent {
            kind,
            version,
            table_id,
            flags,
            column_count,
            present_before,
            present_after,
            rows_data: r.read_rest().to_vec(),
        })
    }
}

/// Decode the row images of a rows event against its table descriptor.
pub fn decode_rows(event: &RowsEvent, descriptor: &TableDescriptor) -> Result<Vec<RowPair>> {
    if descriptor.columns.len() != event.column_count {
        return Err(ReplicaError::malformed_field(format!(
            "rows event declares {} columns, descriptor for {}.{} has {}",
            event.column_count,
            descriptor.database,
            descriptor.table,
            descriptor.columns.len()
        )));
    }

    let mut r = PacketReader::new(&event.rows_data);
    let mut rows = Vec::new();

    while !r.is_empty() {
        let row = match event.kind {
            RowsKind::Write => RowPair {
                before: None,
                after: Some(decode_image(
                    &mut r,
                    descriptor,
                    &event.present_before,
                    event.column_count,
                )?),
            },
            RowsKind::Delete => RowPair {
                before: Some(decode_image(
                    &mut r,
                    descriptor,
                    &event.present_before,
                    event.column_count,
                )?),
                after: None,
            },
            RowsKind::Update => {
                let before = decode_image(
                    &mut r,
                    descriptor,
                    &event.present_before,
                    event.column_count,
                )?;
                let after_bitmap = event
                    .present_after
                    .as_deref()
                    .unwrap_or(&event.present_before);
                let after = decode_image(&mut r, descriptor, after_bitmap, event.column_count)?;
                RowPair {
                    before: Some(before),
                    after: Some(after),
                }
            }
        };
        rows.push(row);
    }

    Ok(rows)
}

fn decode_image(
    r: &mut PacketReader<'_>,
    descriptor: &TableDescriptor,
    present: &[u8],
    column_count: usize,
) -> Result<Vec<Option<Value>>> {
    let present_count = (0..column_count).filter(|&i| bit_set(present, i)).count();
    let null_bitmap = r.read_bytes(present_count.div_ceil(8))?.to_vec();

    let mut values = Vec::with_capacity(column_count);
    let mut image_idx = 0;
    for col_idx in 0..column_count {
        if !bit_set(present, col_idx) {
            values.push(None);
            continue;
        }
        if bit_set(&null_bitmap, image_idx) {
            values.push(Some(Value::Null));
        } else {
            let meta = descriptor.column_meta(col_idx);
            let (value, used) = decode_value(&meta, r.peek_rest())?;
            r.skip(used)?;
            values.push(Some(value));
        }
        image_idx += 1;
    }
    Ok(values)
}

fn parse_format_description(body: &[u8]) -> Result<FormatDescriptionEvent> {
    let mut r = PacketReader::new(body);
    let binlog_version = r.read_u16()?;
    if binlog_version != 4 {
        return Err(ReplicaError::protocol(format!(
            "unsupported binlog version {binlog_version}"
        )));
    }

    let version_bytes = r.read_bytes(50)?;
    let server_version = String::from_utf8_lossy(version_bytes)
        .trim_end_matches('\0')
        .to_string();
    let create_timestamp = r.read_u32()?;
    let common_header_len = r.read_u8()?;

    // Servers from 5.6.1 on append a checksum-algorithm byte plus the
    // event's own CRC behind the post-header-length array.
    let rest = r.read_rest();
    let (lengths, checksum_alg) = if server_supports_checksum(&server_version) && rest.len() >= 5 {
        (
            &rest[..rest.len() - 5],
            ChecksumAlg::from_u8(rest[rest.len() - 5]),
        )
    } else {
        (rest, ChecksumAlg::Off)
    };

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        create_timestamp,
        common_header_len,
        post_header_lengths: lengths.to_vec(),
        checksum_alg,
    })
}

fn parse_rotate(body: &[u8]) -> Result<RotateEvent> {
    let mut r = PacketReader::new(body);
    let position = r.read_u64()?;
    let next_log = String::from_utf8_lossy(r.read_rest()).into_owned();
    if next_log.is_empty() {
        return Err(ReplicaError::malformed("rotate event with empty log name"));
    }
    Ok(RotateEvent { position, next_log })
}

fn parse_query(body: &[u8]) -> Result<QueryEvent> {
    let mut r = PacketReader::new(body);
    let thread_id = r.read_u32()?;
    let exec_time = r.read_u32()?;
    let schema_len = r.read_u8()? as usize;
    let error_code = r.read_u16()?;
    let status_vars_len = r.read_u16()? as usize;
    r.skip(status_vars_len)?;
    let schema = String::from_utf8_lossy(r.read_bytes(schema_len)?).into_owned();
    r.skip(1)?;
    let query = String::from_utf8_lossy(r.read_rest()).into_owned();

    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        schema,
        query,
    })
}

fn parse_xid(body: &[u8]) -> Result<XidEvent> {
    let mut r = PacketReader::new(body);
    Ok(XidEvent { xid: r.read_u64()? })
}

/// Column metadata widths vary per type; the STRING/ENUM/SET pair is packed
/// high-byte-first so the real type lands in the upper metadata byte.
fn parse_column_metadata(types: &[ColumnType], raw: &[u8]) -> Result<Vec<u16>> {
    let mut r = PacketReader::new(raw);
    let mut out = Vec::with_capacity(types.len());
    for t in types {
        let meta = match t {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry => r.read_u8()? as u16,
            ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => r.read_u16()?,
            ColumnType::NewDecimal => {
                let precision = r.read_u8()? as u16;
                let scale = r.read_u8()? as u16;
                (precision << 8) | scale
            }
            ColumnType::String | ColumnType::Enum | ColumnType::Set => {
                let b0 = r.read_u8()? as u16;
                let b1 = r.read_u8()? as u16;
                (b0 << 8) | b1
            }
            ColumnType::Timestamp2 | ColumnType::DateTime2 | ColumnType::Time2 => {
                r.read_u8()? as u16
            }
            _ => 0,
        };
        out.push(meta);
    }
    if !r.is_empty() {
        return Err(ReplicaError::malformed(format!(
            "{} bytes of column metadata left over",
            r.remaining()
        )));
    }
    Ok(out)
}

fn server_supports_checksum(server_version: &str) -> bool {
    let mut parts = server_version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u32>().ok());
    let (major, minor, patch) = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    (major, minor, patch) >= (5, 6, 1)
}

pub(crate) fn bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map(|b| b & (1 << (idx % 8)) != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, TableDescriptor};

    fn header_bytes(event_type: u8, body_len: usize, next_position: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(EventHeader::SIZE + body_len);
        out.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        out.push(event_type);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&((EventHeader::SIZE + body_len) as u32).to_le_bytes());
        out.extend_from_slice(&next_position.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    fn fde_bytes(server_version: &str, checksum: u8) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut version = [0u8; 50];
        version[..server_version.len()].copy_from_slice(server_version.as_bytes());
        body.extend_from_slice(&version);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(19);
        // Post-header lengths for event types 1..=35
        let mut lengths = vec![0u8; 35];
        lengths[EventType::Rotate.code() as usize - 1] = 8;
        lengths[EventType::TableMap.code() as usize - 1] = 8;
        lengths[EventType::WriteRowsV2.code() as usize - 1] = 10;
        lengths[EventType::UpdateRowsV2.code() as usize - 1] = 10;
        lengths[EventType::DeleteRowsV2.code() as usize - 1] = 10;
        body.extend_from_slice(&lengths);
        body.push(checksum);
        body.extend_from_slice(&[0u8; 4]); // own CRC, unchecked
        let mut event = header_bytes(EventType::FormatDescription.code(), body.len(), 0);
        event.extend_from_slice(&body);
        event
    }

    fn decoder_with_fde(checksum: u8) -> BinlogEventDecoder {
        let mut decoder = BinlogEventDecoder::new();
        decoder.decode(&fde_bytes("8.0.36", checksum)).unwrap();
        decoder
    }

    fn append_checksum(mut event: Vec<u8>) -> Vec<u8> {
        // Re-fix the header length to include the 4-byte trailer
        event.extend_from_slice(&[0u8; 4]);
        let len = event.len() as u32;
        event[9..13].copy_from_slice(&len.to_le_bytes());
        event
    }

    fn int_descriptor() -> TableDescriptor {
        TableDescriptor::from_parts(
            "test",
            "test",
            vec![(ColumnType::Long, 0u16, true)],
            vec![ColumnSpec {
                name: "value".into(),
                column_type: "int".into(),
                charset: None,
                nullable: true,
            }],
        )
    }

    #[test]
    fn test_header_parse() {
        let event = fde_bytes("8.0.36", 1);
        let header = EventHeader::parse(&event).unwrap();
        assert_eq!(header.event_type, EventType::FormatDescription);
        assert_eq!(header.event_length as usize, event.len());
        assert_eq!(header.server_id, 1);
    }

    #[test]
    fn test_event_length_mismatch_is_fatal() {
        let mut event = fde_bytes("8.0.36", 0);
        event.push(0xAA);
        let mut decoder = BinlogEventDecoder::new();
        assert!(matches!(
            decoder.decode(&event),
            Err(ReplicaError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_fde_announces_checksum() {
        let decoder = decoder_with_fde(1);
        assert_eq!(decoder.checksum(), ChecksumAlg::Crc32);
        let fde = decoder.format_description().unwrap();
        assert_eq!(fde.binlog_version, 4);
        assert_eq!(fde.server_version, "8.0.36");
        assert_eq!(fde.post_header_len(EventType::WriteRowsV2), Some(10));
    }

    #[test]
    fn test_fde_without_checksum_support() {
        let mut decoder = BinlogEventDecoder::new();
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut version = [0u8; 50];
        version[..5].copy_from_slice(b"5.5.8");
        body.extend_from_slice(&version);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(19);
        body.extend_from_slice(&vec![0u8; 27]);
        let mut event = header_bytes(EventType::FormatDescription.code(), body.len(), 0);
        event.extend_from_slice(&body);

        decoder.decode(&event).unwrap();
        assert_eq!(decoder.checksum(), ChecksumAlg::Off);
    }

    #[test]
    fn test_events_require_fde() {
        let mut decoder = BinlogEventDecoder::new();
        let mut event = header_bytes(EventType::Xid.code(), 8, 500);
        event.extend_from_slice(&42u64.to_le_bytes());
        assert!(matches!(
            decoder.decode(&event),
            Err(ReplicaError::Protocol(_))
        ));
    }

    #[test]
    fn test_rotate_allowed_before_fde() {
        let mut decoder = BinlogEventDecoder::new();
        let mut body = 4u64.to_le_bytes().to_vec();
        body.extend_from_slice(b"mysql-bin.000002");
        let mut event = header_bytes(EventType::Rotate.code(), body.len(), 0);
        event.extend_from_slice(&body);

        let (_, parsed) = decoder.decode(&event).unwrap();
        match parsed {
            BinlogEvent::Rotate(rotate) => {
                assert_eq!(rotate.position, 4);
                assert_eq!(rotate.next_log, "mysql-bin.000002");
            }
            other => panic!("expected rotate, got {other:?}"),
        }
    }

    #[test]
    fn test_xid_with_checksum_trailer() {
        let mut decoder = decoder_with_fde(1);
        let mut event = header_bytes(EventType::Xid.code(), 8, 900);
        event.extend_from_slice(&77u64.to_le_bytes());
        let event = append_checksum(event);

        let (header, parsed) = decoder.decode(&event).unwrap();
        assert_eq!(header.next_position, 900);
        match parsed {
            BinlogEvent::Xid(xid) => assert_eq!(xid.xid, 77),
            other => panic!("expected xid, got {other:?}"),
        }
    }

    #[test]
    fn test_query_event() {
        let mut decoder = decoder_with_fde(0);
        let mut body = Vec::new();
        body.extend_from_slice(&9u32.to_le_bytes()); // thread id
        body.extend_from_slice(&0u32.to_le_bytes()); // exec time
        body.push(4); // schema length
        body.extend_from_slice(&0u16.to_le_bytes()); // error code
        body.extend_from_slice(&2u16.to_le_bytes()); // status vars length
        body.extend_from_slice(&[0x00, 0x00]); // status vars
        body.extend_from_slice(b"test\0");
        body.extend_from_slice(b"BEGIN");
        let mut event = header_bytes(EventType::Query.code(), body.len(), 600);
        event.extend_from_slice(&body);

        let (_, parsed) = decoder.decode(&event).unwrap();
        match parsed {
            BinlogEvent::Query(query) => {
                assert_eq!(query.schema, "test");
                assert!(query.is_begin());
                assert!(!query.is_schema_change());
            }
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn test_query_schema_change_detection() {
        let query = QueryEvent {
            thread_id: 1,
            exec_time: 0,
            error_code: 0,
            schema: "test".into(),
            query: "alter table test add column extra int".into(),
        };
        assert!(query.is_schema_change());
        assert!(!query.is_begin());
    }

    fn table_map_body(table_id_bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(table_id_bytes);
        body.extend_from_slice(&1u16.to_le_bytes()); // flags
        body.push(4);
        body.extend_from_slice(b"test\0");
        body.push(4);
        body.extend_from_slice(b"test\0");
        body.push(1); // column count
        body.push(ColumnType::Long.as_u8());
        body.push(0); // metadata length
        body.push(0b0000_0001); // null bitmap: column nullable
        body
    }

    #[test]
    fn test_table_map() {
        let mut decoder = decoder_with_fde(0);
        let body = table_map_body(&[0x2A, 0, 0, 0, 0, 0]);
        let mut event = header_bytes(EventType::TableMap.code(), body.len(), 700);
        event.extend_from_slice(&body);

        let (_, parsed) = decoder.decode(&event).unwrap();
        match parsed {
            BinlogEvent::TableMap(map) => {
                assert_eq!(map.table_id, 42);
                assert_eq!(map.database, "test");
                assert_eq!(map.table, "test");
                assert_eq!(map.column_count, 1);
                assert_eq!(map.column_types, vec![ColumnType::Long]);
                assert_eq!(map.column_metadata, vec![0]);
                assert!(map.nullable(0));
            }
            other => panic!("expected table map, got {other:?}"),
        }
    }

    fn write_rows_body(value: i32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x2A, 0, 0, 0, 0, 0]); // table id
        body.extend_from_slice(&1u16.to_le_bytes()); // flags
        body.extend_from_slice(&2u16.to_le_bytes()); // v2 extra-data: just the length
        body.push(1); // column count
        body.push(0b0000_0001); // present bitmap
        body.push(0b0000_0000); // null bitmap
        body.extend_from_slice(&value.to_le_bytes());
        body
    }

    #[test]
    fn test_write_rows_v2() {
        let mut decoder = decoder_with_fde(0);
        let body = write_rows_body(12321);
        let mut event = header_bytes(EventType::WriteRowsV2.code(), body.len(), 800);
        event.extend_from_slice(&body);

        let (_, parsed) = decoder.decode(&event).unwrap();
        let BinlogEvent::Rows(rows) = parsed else {
            panic!("expected rows event")
        };
        assert_eq!(rows.kind, RowsKind::Write);
        assert_eq!(rows.version, 2);
        assert_eq!(rows.table_id, 42);

        let decoded = decode_rows(&rows, &int_descriptor()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].before, None);
        assert_eq!(
            decoded[0].after,
            Some(vec![Some(Value::Int(12321))])
        );
    }

    #[test]
    fn test_update_rows_pairs() {
        let mut decoder = decoder_with_fde(0);
        let mut body = Vec::new();
        body.extend_from_slice(&[0x2A, 0, 0, 0, 0, 0]);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.push(1);
        body.push(0b0000_0001); // before image bitmap
        body.push(0b0000_0001); // after image bitmap
        body.push(0b0000_0000); // before null bitmap
        body.extend_from_slice(&100i32.to_le_bytes());
        body.push(0b0000_0000); // after null bitmap
        body.extend_from_slice(&200i32.to_le_bytes());
        let mut event = header_bytes(EventType::UpdateRowsV2.code(), body.len(), 850);
        event.extend_from_slice(&body);

        let (_, parsed) = decoder.decode(&event).unwrap();
        let BinlogEvent::Rows(rows) = parsed else {
            panic!("expected rows event")
        };
        assert_eq!(rows.kind, RowsKind::Update);

        let decoded = decode_rows(&rows, &int_descriptor()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].before, Some(vec![Some(Value::Int(100))]));
        assert_eq!(decoded[0].after, Some(vec![Some(Value::Int(200))]));
    }

    #[test]
    fn test_delete_rows_null_column() {
        let mut decoder = decoder_with_fde(0);
        let mut body = Vec::new();
        body.extend_from_slice(&[0x2A, 0, 0, 0, 0, 0]);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(1); // column count (v1: no extra data)
        body.push(0b0000_0001);
        body.push(0b0000_0001); // null bitmap: column is NULL
        let mut event = header_bytes(EventType::DeleteRowsV1.code(), body.len(), 860);
        event.extend_from_slice(&body);

        let (_, parsed) = decoder.decode(&event).unwrap();
        let BinlogEvent::Rows(rows) = parsed else {
            panic!("expected rows event")
        };
        assert_eq!(rows.kind, RowsKind::Delete);
        assert_eq!(rows.version, 1);

        let decoded = decode_rows(&rows, &int_descriptor()).unwrap();
        assert_eq!(decoded[0].before, Some(vec![Some(Value::Null)]));
        assert_eq!(decoded[0].after, None);
    }

    #[test]
    fn test_unknown_event_skipped() {
        let mut decoder = decoder_with_fde(0);
        let mut event = header_bytes(26, 4, 0); // INCIDENT_EVENT, unhandled
        event.extend_from_slice(&[1, 2, 3, 4]);
        let (_, parsed) = decoder.decode(&event).unwrap();
        assert!(matches!(parsed, BinlogEvent::Skipped(EventType::Unknown(26))));
    }

    #[test]
    fn test_multi_row_write() {
        let mut decoder = decoder_with_fde(0);
        let mut body = Vec::new();
        body.extend_from_slice(&[0x2A, 0, 0, 0, 0, 0]);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.push(1);
        body.push(0b0000_0001);
        for value in [1i32, 2, 3] {
            body.push(0);
            body.extend_from_slice(&value.to_le_bytes());
        }
        let mut event = header_bytes(EventType::WriteRowsV2.code(), body.len(), 870);
        event.extend_from_slice(&body);

        let (_, parsed) = decoder.decode(&event).unwrap();
        let BinlogEvent::Rows(rows) = parsed else {
            panic!("expected rows event")
        };
        let decoded = decode_rows(&rows, &int_descriptor()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].after, Some(vec![Some(Value::Int(3))]));
    }

    #[test]
    fn test_bit_helpers() {
        assert!(bit_set(&[0b0000_0101], 0));
        assert!(!bit_set(&[0b0000_0101], 1));
        assert!(bit_set(&[0b0000_0101], 2));
        assert!(bit_set(&[0x80, 0x01], 7));
        assert!(bit_set(&[0x80, 0x01], 8));
        assert!(!bit_set(&[0x80], 64));
    }

    #[test]
    fn test_checksum_version_gate() {
        assert!(server_supports_checksum("8.0.36"));
        assert!(server_supports_checksum("5.6.1-log"));
        assert!(server_supports_checksum("10.11.6-MariaDB"));
        assert!(!server_supports_checksum("5.5.62"));
        assert!(!server_supports_checksum("5.1.73"));
    }
}
