//! Replication client and supervisory driver
//!
//! Owns the dump connection, the event decoder, the schema mirror and the
//! dispatch path. `run_until` is the blocking entry point: it loops until
//! the caller's stop predicate fires, reconnecting with backoff on
//! transport failures and resuming from the last committed position.
//!
//! Position tracking is two-tier. The in-transaction offset advances on
//! every event and only feeds `set_last_event_time_pos`. The committed
//! `(log_name, offset)` pair advances on XID and ROTATE alone, is the only
//! pair handed to `set_master_log_name_pos`, and is where a reconnect
//! resumes; a checkpoint can never land mid-transaction.

use crate::dispatch::{Callback, CallbackRegistry, ChangeRecord, EventKind};
use crate::error::{ErrorCategory, ReplicaError, Result};
use crate::event::{decode_rows, BinlogEvent, BinlogEventDecoder, ChecksumAlg, EventHeader};
use crate::protocol::{Connection, StopHandle};
use crate::query::QueryClient;
use crate::resilience::{ExponentialBackoff, ProtocolFailureTracker};
use crate::schema::SchemaMirror;
use crate::state::{BinlogPosition, ExternalState, MasterInfo};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, trace, warn};

/// Consecutive protocol failures tolerated before the supervisor gives up.
const PROTOCOL_FAILURE_THRESHOLD: u32 = 5;

/// Reconnect backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A replication slave to one MySQL-compatible primary.
pub struct ReplicaClient {
    master_info: MasterInfo,
    registry: CallbackRegistry,
    mirror: SchemaMirror,
    ext_state: Arc<dyn ExternalState>,
    stop: StopHandle,
    initialized: bool,
}

impl std::fmt::Debug for ReplicaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaClient")
            .field("master_info", &self.master_info)
            .field("registry", &self.registry)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl ReplicaClient {
    pub fn new(ext_state: Arc<dyn ExternalState>) -> Self {
        Self {
            master_info: MasterInfo::default(),
            registry: CallbackRegistry::new(),
            mirror: SchemaMirror::new(),
            ext_state,
            stop: StopHandle::new(),
            initialized: false,
        }
    }

    /// Set host, port, credentials and (optionally) the resume position.
    pub fn set_master_info(&mut self, info: MasterInfo) {
        self.master_info = info;
    }

    pub fn master_info(&self) -> &MasterInfo {
        &self.master_info
    }

    /// Last committed `(log_name, offset)`.
    pub fn last_binlog(&self) -> BinlogPosition {
        self.master_info.position.clone()
    }

    /// Add or replace the callback for `(database, table)`.
    pub fn register_callback(
        &mut self,
        database: impl Into<String>,
        table: impl Into<String>,
        callback: Callback,
        filter: EventKind,
    ) {
        self.registry
            .register(database, table, filter, callback);
        self.initialized = false;
    }

    /// Handle for interrupting the connection from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Thread-safe interrupt: fails the in-flight read; the supervisor
    /// reconnects unless the stop predicate says otherwise.
    pub fn close_connection(&self) {
        self.stop.close_connection();
    }

    /// Resolve column ordering for every registered table. Fails fast with
    /// [`ReplicaError::UnknownTable`] when a table is missing.
    pub async fn init(&mut self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(ReplicaError::invalid_config(
                "no callbacks registered before init()",
            ));
        }
        if self.master_info.host.is_empty() {
            return Err(ReplicaError::invalid_config("master host is empty"));
        }
        if self.master_info.server_id == 0 {
            return Err(ReplicaError::invalid_config("server_id must be nonzero"));
        }

        let info = self.master_info.clone();
        let mut metadata = QueryClient::connect(
            &info.host,
            info.port,
            &info.user,
            info.password.as_deref(),
        )
        .await?;

        let tables: Vec<(String, String)> = self
            .registry
            .tables()
            .map(|(db, t)| (db.to_string(), t.to_string()))
            .collect();
        for (database, table) in tables {
            let specs = metadata.table_columns(&database, &table).await?;
            debug!(
                table = %format!("{database}.{table}"),
                columns = specs.len(),
                "resolved column ordering"
            );
            self.mirror.set_column_specs(&database, &table, specs);
            self.ext_state
                .init_table_count(&format!("{database}.{table}"));
        }

        self.initialized = true;
        Ok(())
    }

    /// Blocking main loop. The predicate is checked between events and on
    /// every reconnect iteration; it doubles as a liveness beacon for
    /// embedders. Returns when the predicate fires, or with the error that
    /// ended the loop.
    pub async fn run_until<F>(&mut self, mut stop: F) -> Result<()>
    where
        F: FnMut() -> bool + Send,
    {
        if !self.initialized {
            return Err(ReplicaError::invalid_config(
                "init() must complete before run_until()",
            ));
        }

        let mut backoff =
            ExponentialBackoff::new(self.master_info.connect_retry, MAX_BACKOFF);
        let mut failures = ProtocolFailureTracker::new(PROTOCOL_FAILURE_THRESHOLD);

        loop {
            if stop() {
                return Ok(());
            }
            self.stop.rearm();

            match self
                .stream_once(&mut stop, &mut backoff, &mut failures)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => match e.category() {
                    ErrorCategory::Usage => return Err(e),
                    ErrorCategory::Protocol => {
                        if failures.record() {
                            error!(error = %e, "protocol errors persist beyond threshold");
                            return Err(e);
                        }
                        warn!(error = %e, "protocol error, reconnecting");
                    }
                    ErrorCategory::Server if !e.is_retriable() => {
                        error!(error = %e, "server refused replication");
                        return Err(e);
                    }
                    _ => {
                        failures.reset();
                        debug!(error = %e, "connection lost, reconnecting");
                    }
                },
            }

            if stop() {
                return Ok(());
            }
            let delay = backoff.next_backoff();
            trace!(?delay, "reconnect backoff");
            sleep(delay).await;
        }
    }

    /// One connection lifetime: connect, register, dump, stream. Returns
    /// `Ok(())` only when the stop predicate fired.
    async fn stream_once<F>(
        &mut self,
        stop: &mut F,
        backoff: &mut ExponentialBackoff,
        failures: &mut ProtocolFailureTracker,
    ) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let info = self.master_info.clone();
        self.ext_state.set_connecting();

        // Metadata channel: position discovery, checksum, column lookups
        let mut metadata = QueryClient::connect(
            &info.host,
            info.port,
            &info.user,
            info.password.as_deref(),
        )
        .await?;

        if !self.master_info.position.is_set() {
            let position = match self.ext_state.load_master_info() {
                Some(position) if position.is_set() => {
                    debug!(%position, "resuming from host-provided position");
                    position
                }
                _ => metadata.master_status().await?,
            };
            info!(%position, "starting replication");
            self.master_info.position = position;
        }

        let checksum = match metadata.global_variable("binlog_checksum").await? {
            Some(v) if v.eq_ignore_ascii_case("CRC32") => ChecksumAlg::Crc32,
            _ => ChecksumAlg::Off,
        };

        let mut conn = Connection::connect(
            &info.host,
            info.port,
            &info.user,
            info.password.as_deref(),
            self.stop.clone(),
        )
        .await?;

        // Acknowledge the primary's checksum setting; pre-5.6 servers
        // reject the variable, which is fine.
        if let Err(e) = conn
            .execute("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            debug!(error = %e, "binlog checksum negotiation skipped");
        }

        conn.register_slave(info.server_id, 0).await?;

        let position = self.master_info.position.clone();
        let mut stream = conn
            .binlog_dump(info.server_id, &position.log_name, position.offset)
            .await?;

        // Streaming reached; earlier trouble is behind us
        backoff.reset();
        failures.reset();

        // Table ids are connection-scoped state; rebuild from the stream
        self.mirror.drop_all();
        let mut decoder = BinlogEventDecoder::new();
        decoder.set_checksum(checksum);
        let mut current_log = position.log_name;

        loop {
            if stop() {
                return Ok(());
            }

            let frame = match stream.next_event().await? {
                Some(frame) => frame,
                None => return Err(ReplicaError::UnexpectedEof),
            };

            let (header, event) = match decoder.decode(&frame) {
                Ok(decoded) => decoded,
                Err(e) if e.is_skippable_decode() => {
                    warn!(error = %e, "skipping undecodable event");
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.handle_event(&mut metadata, &header, event, &mut current_log)
                .await?;
        }
    }

    async fn handle_event(
        &mut self,
        metadata: &mut QueryClient,
        header: &EventHeader,
        event: BinlogEvent,
        current_log: &mut String,
    ) -> Result<()> {
        // Tier one: in-transaction progress, every event
        if header.next_position != 0 {
            self.ext_state
                .set_last_event_time_pos(header.timestamp as u64, header.next_position as u64);
        }

        match event {
            BinlogEvent::FormatDescription(fde) => {
                trace!(server_version = %fde.server_version, "format description");
            }
            BinlogEvent::Rotate(rotate) => {
                debug!(log_name = %rotate.next_log, offset = rotate.position, "rotate");
                *current_log = rotate.next_log.clone();
                self.commit_position(BinlogPosition::new(rotate.next_log, rotate.position));
            }
            BinlogEvent::Query(query) => {
                if query.is_begin() {
                    trace!("transaction start");
                } else if query.is_schema_change() {
                    let lowered = query.query.to_lowercase();
                    let touched: Vec<(String, String)> = self
                        .registry
                        .tables()
                        .filter(|(_, table)| lowered.contains(&table.to_lowercase()))
                        .map(|(db, table)| (db.to_string(), table.to_string()))
                        .collect();
                    for (database, table) in touched {
                        warn!(
                            table = %format!("{database}.{table}"),
                            "DDL observed; column ordering will be re-read"
                        );
                        self.mirror.invalidate_table(&database, &table);
                    }
                }
            }
            BinlogEvent::Xid(xid) => {
                // Tier two: committed checkpoint, XID boundary only
                let offset = header.next_position as u64;
                trace!(xid = xid.xid, offset, "transaction commit");
                if offset != 0 {
                    self.commit_position(BinlogPosition::new(current_log.clone(), offset));
                }
            }
            BinlogEvent::TableMap(map) => {
                if self.registry.contains(&map.database, &map.table) {
                    if !self.mirror.specs_current(&map) {
                        let specs = metadata.table_columns(&map.database, &map.table).await?;
                        self.mirror.set_column_specs(&map.database, &map.table, specs);
                    }
                    self.mirror.upsert(&map)?;
                } else {
                    self.mirror.ignore(map.table_id);
                }
            }
            BinlogEvent::Rows(rows) => {
                if self.mirror.is_ignored(rows.table_id) {
                    return Ok(());
                }
                let descriptor = match self.mirror.lookup(rows.table_id) {
                    Some(descriptor) => descriptor.clone(),
                    None => {
                        warn!(
                            error = %ReplicaError::SchemaMiss(rows.table_id),
                            "row event without table map; dropping"
                        );
                        return Ok(());
                    }
                };

                let pairs = match decode_rows(&rows, &descriptor) {
                    Ok(pairs) => pairs,
                    Err(e) if e.is_skippable_decode() => {
                        warn!(
                            table = %format!("{}.{}", descriptor.database, descriptor.table),
                            error = %e,
                            "skipping undecodable row event"
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };

                for pair in &pairs {
                    let record = ChangeRecord::from_row(&descriptor, rows.kind, pair);
                    if self.registry.dispatch(&record)? {
                        self.ext_state
                            .inc_table_count(&format!("{}.{}", record.database, record.table));
                    }
                }
            }
            BinlogEvent::Heartbeat | BinlogEvent::Stop | BinlogEvent::Skipped(_) => {}
        }

        Ok(())
    }

    fn commit_position(&mut self, position: BinlogPosition) {
        self.master_info.position = position.clone();
        self.ext_state
            .set_master_log_name_pos(&position.log_name, position.offset);
        self.ext_state.save_master_info();
    }
}
