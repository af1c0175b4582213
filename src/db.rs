use std::io;
use std::path::{Path, PathBuf};

use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: Option<PathBuf>,
}

pub struct DatabaseBootstrap {
    pub context: DatabaseContext,
    pub recovered: bool,
}

/// Opens (or creates) the store under `data_dir`. A file that SQLite refuses
/// to read as a database is discarded and recreated.
pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseBootstrap> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    match establish_context(&db_path) {
        Ok(context) => {
            info!(
                target: "database_bootstrap",
                path = %db_path.display(),
                "database ready"
            );
            Ok(DatabaseBootstrap {
                context,
                recovered: false,
            })
        }
        Err(AppError::Database(err)) if is_unreadable(&err, &db_path) => {
            warn!(
                target: "database_bootstrap",
                path = %db_path.display(),
                error = %err,
                "database failed to open, recreating"
            );
            discard_store(&db_path)?;
            let context = establish_context(&db_path)?;
            Ok(DatabaseBootstrap {
                context,
                recovered: true,
            })
        }
        Err(err) => Err(err),
    }
}

pub fn open_in_memory() -> AppResult<DatabaseContext> {
    let connection = Connection::open_in_memory()?;
    configure(&connection)?;
    run_migrations(&connection)?;
    Ok(DatabaseContext {
        connection,
        path: None,
    })
}

fn establish_context(db_path: &Path) -> AppResult<DatabaseContext> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;
    Ok(DatabaseContext {
        connection,
        path: Some(db_path.to_path_buf()),
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            entity_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'deleted')),
            version INTEGER NOT NULL DEFAULT 1,
            external_id TEXT,
            data TEXT NOT NULL DEFAULT '{}',
            sync_status TEXT NOT NULL DEFAULT 'pending',
            server_id TEXT,
            last_synced_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS restaurants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            curator_id TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'manual',
            server_id TEXT,
            description TEXT,
            transcription TEXT,
            latitude REAL,
            longitude REAL,
            address TEXT,
            photos TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS restaurant_concepts (
            restaurant_id INTEGER NOT NULL,
            category TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (restaurant_id, category, value),
            FOREIGN KEY (restaurant_id) REFERENCES restaurants(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_entities_external_id ON entities(external_id);
        CREATE INDEX IF NOT EXISTS idx_entities_type_status ON entities(entity_type, status);
        "#,
    )?;

    ensure_column(
        connection,
        "restaurants",
        "entity_id",
        "TEXT REFERENCES entities(entity_id) ON DELETE SET NULL",
    )?;
    connection.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_restaurants_source_server
        ON restaurants(source, server_id) WHERE server_id IS NOT NULL",
        [],
    )?;
    Ok(())
}

/// Adds `column` to `table` unless an earlier run already did.
fn ensure_column(
    connection: &Connection,
    table: &str,
    column: &str,
    declaration: &str,
) -> AppResult<()> {
    if column_exists(connection, table, column)? {
        return Ok(());
    }
    connection.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {declaration}"), [])?;
    info!(target: "database_bootstrap", table, column, "column added");
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let matches: i64 = connection.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(matches > 0)
}

/// Only a file SQLite cannot read as a database is worth discarding; locks and
/// permission errors are returned to the caller.
fn is_unreadable(err: &SqliteError, db_path: &Path) -> bool {
    db_path.exists()
        && matches!(
            err.sqlite_error_code(),
            Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
        )
}

fn discard_store(db_path: &Path) -> AppResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let path = sidecar_path(db_path, suffix);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(AppError::Io(err));
            }
        }
    }
    Ok(())
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
