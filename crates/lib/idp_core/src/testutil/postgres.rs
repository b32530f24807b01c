//! Throwaway PostgreSQL instances for tests.
//!
//! `DbManager` runs `initdb`, `pg_ctl` and `pg_isready` from the binaries
//! found via `pg_config --bindir`, in a temporary data directory that is
//! removed on drop.

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::PgPool;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, warn};

/// Database created inside the ephemeral cluster.
const DEFAULT_DATABASE: &str = "idp";

/// Maximum time to wait for PostgreSQL to become ready.
const PG_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval when waiting for PostgreSQL readiness.
const PG_READY_POLL: Duration = Duration::from_millis(200);

/// Errors from managing the ephemeral cluster.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("PostgreSQL command failed: {0}")]
    Command(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pg_config not found on PATH")]
    PgConfigNotFound,

    #[error("PostgreSQL not ready after {0:?}")]
    ReadyTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// A PostgreSQL cluster living in a temporary directory.
pub struct DbManager {
    bin_dir: PathBuf,
    data_dir: PathBuf,
    port: u16,
    database_name: String,
    started: bool,
    _tempdir: tempfile::TempDir,
}

impl DbManager {
    /// Locate the server binaries and reserve a temporary data directory.
    pub async fn ephemeral() -> Result<Self> {
        let output = Command::new("pg_config")
            .arg("--bindir")
            .output()
            .await
            .map_err(|_| DbError::PgConfigNotFound)?;
        if !output.status.success() {
            return Err(DbError::PgConfigNotFound);
        }
        let bin_dir = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());

        let tempdir = tempfile::tempdir()?;
        Ok(Self {
            bin_dir,
            data_dir: tempdir.path().join("pgdata"),
            port: 0,
            database_name: DEFAULT_DATABASE.to_string(),
            started: false,
            _tempdir: tempdir,
        })
    }

    /// `initdb` the data directory.
    pub async fn setup(&mut self) -> Result<()> {
        let output = Command::new(self.bin_dir.join("initdb"))
            .arg("-D")
            .arg(&self.data_dir)
            .arg("--no-locale")
            .arg("--encoding=UTF8")
            .arg("--auth=trust")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DbError::Command(format!("initdb failed: {stderr}")));
        }
        Ok(())
    }

    /// Start the server on a free port and create the test database.
    pub async fn start(&mut self) -> Result<()> {
        if self.port == 0 {
            self.port = find_free_port()?;
        }

        let port_opt = format!(
            "-p {} -k {} -h localhost",
            self.port,
            self.data_dir.display()
        );
        let output = Command::new(self.bin_dir.join("pg_ctl"))
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-o")
            .arg(&port_opt)
            .arg("-l")
            .arg(self.data_dir.join("postgresql.log"))
            .arg("start")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DbError::Command(format!("pg_ctl start failed: {stderr}")));
        }

        self.wait_for_ready().await?;
        self.started = true;
        info!(port = self.port, "ephemeral PostgreSQL started");

        self.create_database().await
    }

    /// Stop the server.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        let output = Command::new(self.bin_dir.join("pg_ctl"))
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-m")
            .arg("fast")
            .arg("stop")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DbError::Command(format!("pg_ctl stop failed: {stderr}")));
        }

        self.started = false;
        Ok(())
    }

    pub fn connection_url(&self) -> String {
        format!(
            "postgresql://localhost:{}/{}",
            self.port, self.database_name
        )
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    async fn wait_for_ready(&self) -> Result<()> {
        let pg_isready = self.bin_dir.join("pg_isready");
        let deadline = tokio::time::Instant::now() + PG_READY_TIMEOUT;

        loop {
            let output = Command::new(&pg_isready)
                .arg("-p")
                .arg(self.port.to_string())
                .arg("-h")
                .arg("localhost")
                .output()
                .await?;

            if output.status.success() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DbError::ReadyTimeout(PG_READY_TIMEOUT));
            }
            sleep(PG_READY_POLL).await;
        }
    }

    async fn create_database(&self) -> Result<()> {
        let maintenance_url = format!("postgresql://localhost:{}/postgres", self.port);
        let pool = PgPool::connect(&maintenance_url).await?;
        // CREATE DATABASE cannot use bind parameters
        let sql = format!("CREATE DATABASE \"{}\"", self.database_name);
        sqlx::query(&sql).execute(&pool).await?;
        pool.close().await;
        Ok(())
    }
}

impl Drop for DbManager {
    fn drop(&mut self) {
        if !self.started {
            return;
        }
        // Still running: the test failed before calling stop().
        let status = std::process::Command::new(self.bin_dir.join("pg_ctl"))
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-m")
            .arg("immediate")
            .arg("stop")
            .status();
        if let Err(e) = status {
            warn!(error = %e, "failed to stop ephemeral PostgreSQL");
        }
    }
}

fn find_free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
