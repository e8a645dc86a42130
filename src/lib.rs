//! # mysql-replica
//!
//! A replication-slave client for MySQL-compatible primaries. The client
//! registers against the primary with `COM_REGISTER_SLAVE`, streams the
//! row-based binary log, decodes row images against a mirrored table
//! schema, and delivers typed change records to per-table callbacks.
//!
//! ## Architecture
//!
//! ```text
//! bytes ─▶ wire codec ─▶ event decoder ─┬▶ TABLE_MAP ─▶ schema mirror
//!                                       └▶ ROWS ─▶ value decoder ─▶ dispatch ─▶ callback
//!                                 positions ─▶ external-state hook (host)
//! ```
//!
//! Durable position checkpointing is delegated to the host through the
//! [`ExternalState`] capability surface; checkpoints land only on
//! transaction commit (XID) or log rotation, so a resumed stream never
//! starts mid-transaction.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mysql_replica::{EphemeralState, EventKind, MasterInfo, ReplicaClient};
//!
//! # async fn example() -> mysql_replica::Result<()> {
//! let state = EphemeralState::new();
//! let mut client = ReplicaClient::new(state);
//! client.set_master_info(
//!     MasterInfo::new("localhost", "repl")
//!         .with_password("secret")
//!         .with_server_id(4242),
//! );
//! client.register_callback(
//!     "shop",
//!     "orders",
//!     Box::new(|record| {
//!         println!("{} on {}.{}", record.kind, record.database, record.table);
//!         Ok(())
//!     }),
//!     EventKind::ALL,
//! );
//! client.init().await?;
//! client.run_until(|| false).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The primary must run with `binlog_format=ROW`; only
//! `mysql_native_password` authentication is spoken.

pub mod client;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod protocol;
pub mod query;
pub mod resilience;
pub mod schema;
pub mod state;
pub mod value;
pub mod wire;

pub use client::ReplicaClient;
pub use dispatch::{Callback, CallbackRegistry, ChangeRecord, EventKind, RowImage};
pub use error::{ErrorCategory, ReplicaError, Result};
pub use event::{
    BinlogEvent, BinlogEventDecoder, ChecksumAlg, EventHeader, EventType, RowsKind,
};
pub use protocol::{BinlogStream, Connection, StopHandle};
pub use query::{QueryClient, ResultSet, TextRow};
pub use schema::{ColumnSpec, SchemaMirror, TableDescriptor};
pub use state::{BinlogPosition, EphemeralState, ExternalState, MasterInfo};
pub use value::{ColumnMeta, ColumnType, Value};
