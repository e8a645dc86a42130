//! Minimal text-protocol query client
//!
//! Used by the replication client to resolve column names and ordering for
//! registered tables, fetch the primary's current binlog position, and read
//! server variables. Result sets use the classic EOF framing; the client
//! never negotiates CLIENT_DEPRECATE_EOF.
//!
//! The text protocol has no parameter binding, so every identifier that is
//! interpolated into SQL is validated first.

use crate::error::{ReplicaError, Result};
use crate::protocol::{Connection, StopHandle};
use crate::schema::ColumnSpec;
use crate::state::BinlogPosition;
use crate::wire::PacketReader;
use bytes::{BufMut, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, trace};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,63}$").unwrap());

/// Reject anything that is not a plain SQL identifier before it is
/// interpolated into a query.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(ReplicaError::invalid_config(format!(
            "invalid identifier {name:?}"
        )))
    }
}

/// Column definition as declared by the server in a result set.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub charset: u16,
    pub column_length: u32,
    pub type_code: u8,
    pub flags: u16,
}

/// One field of a text row: the server-declared type and the raw text
/// value (`None` for SQL NULL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextField {
    pub type_code: u8,
    pub value: Option<String>,
}

/// A text-protocol row keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct TextRow {
    fields: HashMap<String, TextField>,
}

impl TextRow {
    pub fn get(&self, column: &str) -> Option<&TextField> {
        self.fields.get(column)
    }

    /// Non-null text value of a column.
    pub fn text(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(|f| f.value.as_deref())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A buffered result set.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<TextRow>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TextRow> {
        self.rows.iter()
    }
}

/// Text-protocol client over an authenticated connection.
pub struct QueryClient {
    conn: Connection,
}

impl QueryClient {
    /// Connect, authenticate and pin the connection charset.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        let conn = Connection::connect(host, port, user, password, StopHandle::new()).await?;
        let mut client = Self { conn };
        client.execute("SET NAMES utf8mb4").await?;
        Ok(client)
    }

    pub fn server_version(&self) -> &str {
        self.conn.server_version()
    }

    /// Run a statement, discarding any result set.
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.run_query(sql, |_, _| {}).await?;
        Ok(())
    }

    /// Run a query and buffer the full result set.
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        let mut rows = Vec::new();
        let columns = self
            .run_query(sql, |row, _| rows.push(row.clone()))
            .await?;
        Ok(ResultSet { columns, rows })
    }

    /// Run a query and hand each row to `handler` as it is parsed.
    pub async fn use_rows<F>(&mut self, sql: &str, mut handler: F) -> Result<u64>
    where
        F: FnMut(&TextRow),
    {
        let mut count = 0u64;
        self.run_query(sql, |row, _| {
            count += 1;
            handler(row);
        })
        .await?;
        Ok(count)
    }

    async fn run_query<F>(&mut self, sql: &str, mut sink: F) -> Result<Vec<ColumnDef>>
    where
        F: FnMut(&TextRow, &[ColumnDef]),
    {
        trace!(sql, "text query");
        let mut command = BytesMut::with_capacity(1 + sql.len());
        command.put_u8(0x03); // COM_QUERY
        command.put_slice(sql.as_bytes());
        self.conn.write_command(&command).await?;

        let first = self.conn.read_packet().await?;
        match first.first() {
            Some(0x00) => return Ok(Vec::new()),
            Some(0xFF) => return Err(self.conn.server_error(&first[1..])),
            Some(0xFB) => {
                return Err(ReplicaError::protocol(
                    "unexpected LOCAL INFILE request from server",
                ))
            }
            Some(_) => {}
            None => return Err(ReplicaError::UnexpectedEof),
        }

        let column_count = PacketReader::new(&first).read_lenenc_int()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let packet = self.conn.read_packet().await?;
            columns.push(parse_column_def(&packet)?);
        }

        // EOF behind the column definitions
        let eof = self.conn.read_packet().await?;
        if !is_eof(&eof) {
            return Err(ReplicaError::protocol(
                "missing EOF after column definitions",
            ));
        }

        loop {
            let packet = self.conn.read_packet().await?;
            if is_eof(&packet) {
                return Ok(columns);
            }
            if packet.first() == Some(&0xFF) {
                return Err(self.conn.server_error(&packet[1..]));
            }
            let row = parse_text_row(&packet, &columns)?;
            sink(&row, &columns);
        }
    }

    /// Current `(log_name, offset)` of the primary.
    pub async fn master_status(&mut self) -> Result<BinlogPosition> {
        // SHOW MASTER STATUS was removed in MySQL 8.4
        let result = match self.query("SHOW BINARY LOG STATUS").await {
            Ok(result) => result,
            Err(ReplicaError::Server { .. }) => self.query("SHOW MASTER STATUS").await?,
            Err(e) => return Err(e),
        };

        let row = result.rows.first().ok_or_else(|| {
            ReplicaError::protocol(
                "master status returned no rows; is binary logging enabled?",
            )
        })?;
        let log_name = row
            .text("File")
            .ok_or_else(|| ReplicaError::protocol("master status row without File column"))?
            .to_string();
        let offset = row
            .text("Position")
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| {
                ReplicaError::protocol("master status row without numeric Position")
            })?;

        debug!(log_name, offset, "primary binlog position");
        Ok(BinlogPosition::new(log_name, offset))
    }

    /// Value of a global variable, e.g. `binlog_checksum`.
    pub async fn global_variable(&mut self, name: &str) -> Result<Option<String>> {
        validate_identifier(name)?;
        let result = self
            .query(&format!("SHOW GLOBAL VARIABLES LIKE '{name}'"))
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.text("Value"))
            .map(|v| v.to_string()))
    }

    /// Column list for a table in ordinal order, straight from
    /// `information_schema.columns`.
    pub async fn table_columns(&mut self, database: &str, table: &str) -> Result<Vec<ColumnSpec>> {
        validate_identifier(database)?;
        validate_identifier(table)?;

        let sql = format!(
            "SELECT COLUMN_NAME, COLUMN_TYPE, CHARACTER_SET_NAME, IS_NULLABLE \
             FROM information_schema.columns \
             WHERE TABLE_SCHEMA = '{database}' AND TABLE_NAME = '{table}' \
             ORDER BY ORDINAL_POSITION"
        );

        let mut specs = Vec::new();
        self.use_rows(&sql, |row| {
            specs.push(ColumnSpec {
                name: row.text("COLUMN_NAME").unwrap_or_default().to_string(),
                column_type: row.text("COLUMN_TYPE").unwrap_or_default().to_string(),
                charset: row.text("CHARACTER_SET_NAME").map(|c| c.to_string()),
                nullable: row.text("IS_NULLABLE") == Some("YES"),
            });
        })
        .await?;

        if specs.is_empty() {
            return Err(ReplicaError::UnknownTable {
                database: database.to_string(),
                table: table.to_string(),
            });
        }
        Ok(specs)
    }
}

fn is_eof(packet: &[u8]) -> bool {
    packet.first() == Some(&0xFE) && packet.len() < 9
}

fn parse_column_def(packet: &[u8]) -> Result<ColumnDef> {
    let mut r = PacketReader::new(packet);
    let _catalog = r.read_lenenc_bytes()?;
    let _schema = r.read_lenenc_bytes()?;
    let _table = r.read_lenenc_bytes()?;
    let _org_table = r.read_lenenc_bytes()?;
    let name = String::from_utf8_lossy(r.read_lenenc_bytes()?).into_owned();
    let _org_name = r.read_lenenc_bytes()?;
    let _fixed_len = r.read_lenenc_int()?;
    let charset = r.read_u16()?;
    let column_length = r.read_u32()?;
    let type_code = r.read_u8()?;
    let flags = r.read_u16()?;

    Ok(ColumnDef {
        name,
        charset,
        column_length,
        type_code,
        flags,
    })
}

fn parse_text_row(packet: &[u8], columns: &[ColumnDef]) -> Result<TextRow> {
    let mut r = PacketReader::new(packet);
    let mut fields = HashMap::with_capacity(columns.len());
    for col in columns {
        let value = if r.peek_u8()? == 0xFB {
            r.skip(1)?;
            None
        } else {
            Some(String::from_utf8_lossy(r.read_lenenc_bytes()?).into_owned())
        };
        fields.insert(
            col.name.clone(),
            TextField {
                type_code: col.type_code,
                value,
            },
        );
    }
    Ok(TextRow { fields })
}
