//! The warehouse file: fact and dimension tables next to the sync
//! bookkeeping (checkpoints, loaded periods, run log, app config).

pub mod repository;

use std::path::Path;

use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result};

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;\
                       PRAGMA foreign_keys=ON;\
                       PRAGMA busy_timeout=5000;";

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial.sql"))])
}

/// Handle on the warehouse. Job applies and checkpoint commits go through
/// `writer`, one transaction per call; `status` and coverage checks read
/// through `reader` while a sync is writing.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

impl Database {
    /// `~/.sellerdw/sellerdw.db`, created on first use.
    pub async fn open() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
            .join(".sellerdw");
        std::fs::create_dir_all(&dir).map_err(|e| Error::Config(e.to_string()))?;
        Self::open_at(dir.join("sellerdw.db")).await
    }

    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = tokio_rusqlite::Connection::open(&path).await?;
        Self::migrate(&writer).await?;

        let reader = tokio_rusqlite::Connection::open(&path).await?;
        reader
            .call(|conn| conn.execute_batch(PRAGMAS))
            .await?;

        Ok(Self { writer, reader })
    }

    /// A throwaway warehouse for tests. Reads and writes share the one
    /// connection because an in-memory database is private to it.
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::migrate(&writer).await?;
        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    async fn migrate(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS).map_err(|e| e.to_string())?;
            migrations().to_latest(conn).map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        })
        .await
        .map_err(|e| Error::Database(format!("schema migration failed: {e}")))
    }

    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }
}
