//! Master info, binlog positions, and the host-facing state hook
//!
//! The replication client owns its connection state; everything the host
//! wants to observe or persist flows through the [`ExternalState`]
//! capability surface. Committed positions are the only positions handed
//! to the host: `set_master_log_name_pos` fires at XID and ROTATE
//! boundaries, never mid-transaction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A point in the primary's binary log.
///
/// Ordering is lexicographic on the log name first, then the offset, which
/// matches the server's `mysql-bin.NNNNNN` naming.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BinlogPosition {
    pub log_name: String,
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(log_name: impl Into<String>, offset: u64) -> Self {
        Self {
            log_name: log_name.into(),
            offset,
        }
    }

    /// A position is unset until the client resolves or loads one.
    pub fn is_set(&self) -> bool {
        !self.log_name.is_empty()
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.log_name, self.offset)
    }
}

/// Connection target plus last known position.
///
/// Mutated by the user before `run_until` (to pick a resume point) and by
/// the client on every committed advance.
#[derive(Clone, Serialize, Deserialize)]
pub struct MasterInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// Must be unique among all replicas of the primary
    pub server_id: u32,
    /// Base reconnect cadence; backoff grows from here
    pub connect_retry: Duration,
    /// Resume position; unset means "resolve from the host or the primary"
    pub position: BinlogPosition,
}

impl std::fmt::Debug for MasterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .field("connect_retry", &self.connect_retry)
            .field("position", &self.position)
            .finish()
    }
}

impl Default for MasterInfo {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            server_id: 1001,
            connect_retry: Duration::from_secs(1),
            position: BinlogPosition::default(),
        }
    }
}

impl MasterInfo {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_position(mut self, position: BinlogPosition) -> Self {
        self.position = position;
        self
    }

    pub fn with_connect_retry(mut self, retry: Duration) -> Self {
        self.connect_retry = retry;
        self
    }
}

/// Capability surface the host implements to observe and persist the
/// replication state.
///
/// All methods take `&self`; implementations provide their own locking.
/// `set_master_log_name_pos` is called only at committed boundaries and
/// must atomically publish the pair and wake anyone waiting on it.
pub trait ExternalState: Send + Sync {
    /// A connection attempt is starting.
    fn set_connecting(&self);

    /// Number of connection attempts so far.
    fn connect_count(&self) -> u32;

    /// Event-level progress: event timestamp and in-transaction offset.
    /// Advances on every event, including uncommitted ones.
    fn set_last_event_time_pos(&self, time: u64, offset: u64);

    /// Last in-transaction offset observed.
    fn intransaction_pos(&self) -> u64;

    /// Committed-position checkpoint; only XID and ROTATE advance this.
    fn set_master_log_name_pos(&self, log_name: &str, offset: u64);

    fn master_log_name(&self) -> String;

    fn master_log_pos(&self) -> u64;

    /// Durable position for resume, if the host has one.
    fn load_master_info(&self) -> Option<BinlogPosition>;

    /// Persist whatever the host considers durable master info.
    fn save_master_info(&self);

    /// A table entered the registered set.
    fn init_table_count(&self, table: &str);

    /// A row record for `table` was delivered.
    fn inc_table_count(&self, table: &str);
}

#[derive(Debug, Default)]
struct EphemeralInner {
    connecting: bool,
    connect_count: u32,
    last_event_time: u64,
    intransaction_pos: u64,
    committed: BinlogPosition,
    table_counts: HashMap<String, u64>,
}

/// In-memory [`ExternalState`] for embedders that do their own durability,
/// and for tests. `wait_for_position` mirrors the condvar discipline a
/// host would use around the committed pair.
#[derive(Debug, Default)]
pub struct EphemeralState {
    inner: Mutex<EphemeralInner>,
    advanced: Condvar,
}

impl EphemeralState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until the committed position reaches `target` or the timeout
    /// elapses. Returns whether the target was reached.
    pub fn wait_for_position(&self, target: &BinlogPosition, timeout: Duration) -> bool {
        let reached = |inner: &EphemeralInner| {
            inner.committed.log_name.as_str() > target.log_name.as_str()
                || (inner.committed.log_name == target.log_name
                    && inner.committed.offset >= target.offset)
        };

        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, result) = self
            .advanced
            .wait_timeout_while(guard, timeout, |inner| !reached(inner))
            .unwrap_or_else(|e| e.into_inner());
        drop(guard);
        !result.timed_out()
    }

    pub fn table_count(&self, table: &str) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .table_counts
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EphemeralInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ExternalState for EphemeralState {
    fn set_connecting(&self) {
        let mut inner = self.lock();
        inner.connecting = true;
        inner.connect_count += 1;
    }

    fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    fn set_last_event_time_pos(&self, time: u64, offset: u64) {
        let mut inner = self.lock();
        inner.last_event_time = time;
        inner.intransaction_pos = offset;
    }

    fn intransaction_pos(&self) -> u64 {
        self.lock().intransaction_pos
    }

    fn set_master_log_name_pos(&self, log_name: &str, offset: u64) {
        {
            let mut inner = self.lock();
            inner.committed = BinlogPosition::new(log_name, offset);
            inner.intransaction_pos = offset;
        }
        self.advanced.notify_all();
    }

    fn master_log_name(&self) -> String {
        self.lock().committed.log_name.clone()
    }

    fn master_log_pos(&self) -> u64 {
        self.lock().committed.offset
    }

    fn load_master_info(&self) -> Option<BinlogPosition> {
        let inner = self.lock();
        inner.committed.is_set().then(|| inner.committed.clone())
    }

    fn save_master_info(&self) {}

    fn init_table_count(&self, table: &str) {
        self.lock().table_counts.insert(table.to_string(), 0);
    }

    fn inc_table_count(&self, table: &str) {
        *self
            .lock()
            .table_counts
            .entry(table.to_string())
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        let a = BinlogPosition::new("mysql-bin.000001", 500);
        let b = BinlogPosition::new("mysql-bin.000001", 900);
        let c = BinlogPosition::new("mysql-bin.000002", 4);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "mysql-bin.000001:500");
    }

    #[test]
    fn test_position_is_set() {
        assert!(!BinlogPosition::default().is_set());
        assert!(BinlogPosition::new("mysql-bin.000001", 4).is_set());
    }

    #[test]
    fn test_master_info_debug_redacts_password() {
        let info = MasterInfo::new("localhost", "repl").with_password("hunter2");
        let debug = format!("{info:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("localhost"));
    }

    #[test]
    fn test_master_info_builder() {
        let info = MasterInfo::new("db.internal", "repl")
            .with_port(3307)
            .with_server_id(42)
            .with_position(BinlogPosition::new("mysql-bin.000009", 120));
        assert_eq!(info.port, 3307);
        assert_eq!(info.server_id, 42);
        assert_eq!(info.position.offset, 120);
    }

    #[test]
    fn test_ephemeral_state_positions() {
        let state = EphemeralState::new();
        assert!(state.load_master_info().is_none());

        state.set_last_event_time_pos(1_700_000_000, 450);
        assert_eq!(state.intransaction_pos(), 450);
        // Event-level progress is not a committed checkpoint
        assert_eq!(state.master_log_pos(), 0);

        state.set_master_log_name_pos("mysql-bin.000001", 500);
        assert_eq!(state.master_log_name(), "mysql-bin.000001");
        assert_eq!(state.master_log_pos(), 500);
        assert_eq!(state.intransaction_pos(), 500);
        assert_eq!(
            state.load_master_info(),
            Some(BinlogPosition::new("mysql-bin.000001", 500))
        );
    }

    #[test]
    fn test_ephemeral_state_counters() {
        let state = EphemeralState::new();
        state.init_table_count("test");
        assert_eq!(state.table_count("test"), 0);
        state.inc_table_count("test");
        state.inc_table_count("test");
        assert_eq!(state.table_count("test"), 2);

        state.set_connecting();
        state.set_connecting();
        assert_eq!(state.connect_count(), 2);
    }

    #[test]
    fn test_wait_for_position() {
        let state = EphemeralState::new();
        let target = BinlogPosition::new("mysql-bin.000001", 100);

        // Not reached yet
        assert!(!state.wait_for_position(&target, Duration::from_millis(10)));

        let waiter = state.clone();
        let target_clone = target.clone();
        let thread = std::thread::spawn(move || {
            waiter.wait_for_position(&target_clone, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        state.set_master_log_name_pos("mysql-bin.000001", 150);
        assert!(thread.join().unwrap());

        // A later log satisfies an earlier target
        let earlier = BinlogPosition::new("mysql-bin.000000", 900);
        assert!(state.wait_for_position(&earlier, Duration::from_millis(10)));
    }
}
