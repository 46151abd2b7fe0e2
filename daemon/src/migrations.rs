use rusqlite::{params, Connection, Result};
const SCHEMA_VERSION: i32 = 2;

pub struct Migrator {
    conn: Connection,
}

impl Migrator {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn run_migrations(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        log::debug!("Current database schema version: {}", current_version);

        if current_version < SCHEMA_VERSION {
            log::info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);
            self.migrate_from(current_version)?;
        }

        Ok(())
    }

    fn get_current_version(&self) -> Result<i32> {
        let version: Option<i32> = self.conn.query_row(
            "SELECT MAX(version) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    fn migrate_from(&mut self, from_version: i32) -> Result<()> {
        let tx = self.conn.transaction()?;

        for version in (from_version + 1)..=SCHEMA_VERSION {
            log::info!("Applying migration to version {}", version);
            match version {
                1 => Self::migrate_to_v1_impl(&tx)?,
                2 => Self::migrate_to_v2_impl(&tx)?,
                _ => return Err(rusqlite::Error::InvalidQuery),
            }

            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![version],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn migrate_to_v1_impl(tx: &rusqlite::Transaction) -> Result<()> {
        tx.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                source_path TEXT NOT NULL,
                destination_path TEXT NOT NULL,
                schedule_type TEXT NOT NULL DEFAULT 'manual',
                interval_minutes INTEGER,
                active BOOLEAN NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                job_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                message TEXT,
                output_file TEXT,
                FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
            )",
            [],
        )?;

        Ok(())
    }

    fn migrate_to_v2_impl(tx: &rusqlite::Transaction) -> Result<()> {
        // Retention and history both read runs per job newest-first.
        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_job_status_started
             ON runs(job_id, status, started_at DESC)",
            [],
        )?;
        Ok(())
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let mut migrator = Migrator::new(conn);
        migrator.run_migrations().unwrap();
        migrator.run_migrations().unwrap();

        let conn = migrator.into_connection();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, SCHEMA_VERSION as i64);
    }
}
