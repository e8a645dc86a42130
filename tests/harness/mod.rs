//! Test harness for replication integration tests
//!
//! Manages a disposable MySQL container with row-based binlogging and a
//! replication user the client can authenticate as with
//! `mysql_native_password`. The root connection drives the primary; the
//! library under test only ever connects as the replication user.

use anyhow::{Context, Result};
use mysql_async::prelude::Queryable;
use std::sync::Once;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mysql::Mysql;

pub const REPL_USER: &str = "repl";
pub const REPL_PASSWORD: &str = "replpass";
pub const TEST_DATABASE: &str = "test";

static INIT: Once = Once::new();

/// Initialize test logging (idempotent).
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("mysql_replica=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A MySQL primary in a container, binlog_format=ROW (the 8.0 default).
pub struct MySqlTestContainer {
    _container: ContainerAsync<Mysql>,
    port: u16,
}

impl MySqlTestContainer {
    pub async fn start() -> Result<Self> {
        let container = Mysql::default()
            .with_tag("8.0")
            .start()
            .await
            .context("failed to start MySQL container")?;
        let port = container
            .get_host_port_ipv4(3306)
            .await
            .context("failed to resolve mapped port")?;

        let me = Self {
            _container: container,
            port,
        };
        me.bootstrap().await?;
        Ok(me)
    }

    pub fn host(&self) -> &str {
        "127.0.0.1"
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Root connection for driving the primary.
    pub async fn root_conn(&self) -> Result<mysql_async::Conn> {
        let url = format!("mysql://root@127.0.0.1:{}/mysql", self.port);
        let opts = mysql_async::Opts::from_url(&url)?;
        Ok(mysql_async::Conn::new(opts).await?)
    }

    async fn bootstrap(&self) -> Result<()> {
        // The server accepts TCP slightly before authentication works
        let mut conn = None;
        for _ in 0..30 {
            match self.root_conn().await {
                Ok(c) => {
                    conn = Some(c);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
        let mut conn = conn.context("MySQL container never became ready")?;

        for sql in [
            &format!("CREATE DATABASE IF NOT EXISTS {TEST_DATABASE}"),
            &format!(
                "CREATE USER IF NOT EXISTS '{REPL_USER}'@'%' \
                 IDENTIFIED WITH mysql_native_password BY '{REPL_PASSWORD}'"
            ),
            &format!(
                "GRANT REPLICATION SLAVE, REPLICATION CLIENT, SELECT ON *.* \
                 TO '{REPL_USER}'@'%'"
            ),
            &"FLUSH PRIVILEGES".to_string(),
        ] {
            conn.query_drop(sql.as_str())
                .await
                .with_context(|| format!("bootstrap statement failed: {sql}"))?;
        }
        Ok(())
    }

    /// Run statements on the primary in order.
    pub async fn execute_batch(&self, statements: &[&str]) -> Result<()> {
        let mut conn = self.root_conn().await?;
        conn.query_drop(format!("USE {TEST_DATABASE}")).await?;
        for sql in statements {
            conn.query_drop(*sql)
                .await
                .with_context(|| format!("statement failed: {sql}"))?;
        }
        Ok(())
    }

    /// Current `(log_name, offset)` of the primary, from the root side.
    pub async fn master_status(&self) -> Result<(String, u64)> {
        let mut conn = self.root_conn().await?;
        let row: mysql_async::Row = conn
            .query_first("SHOW MASTER STATUS")
            .await?
            .context("SHOW MASTER STATUS returned no rows")?;
        let file: String = row.get(0).context("File column missing")?;
        let position: u64 = row.get(1).context("Position column missing")?;
        Ok((file, position))
    }
}
