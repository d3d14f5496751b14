//! SQLite fixtures shared by the unit tests

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{Connection, Executor, Row};

use crate::database::fsops::with_name_suffix;

const SCHEMA: &str = r#"
    CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE orders (
        id INTEGER PRIMARY KEY,
        customer_id INTEGER NOT NULL REFERENCES customers(id),
        total INTEGER NOT NULL
    );
    CREATE INDEX orders_customer ON orders(customer_id);
"#;

async fn open(path: &Path, journal_mode: SqliteJournalMode, foreign_keys: bool) -> SqliteConnection {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(journal_mode)
        .foreign_keys(foreign_keys);
    SqliteConnection::connect_with(&options).await.unwrap()
}

async fn populate(conn: &mut SqliteConnection, customers: i64) {
    sqlx::raw_sql(SCHEMA).execute(&mut *conn).await.unwrap();
    for id in 1..=customers {
        sqlx::query("INSERT INTO customers (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(format!("customer-{id}"))
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO orders (customer_id, total) VALUES (?, ?)")
            .bind(id)
            .bind(id * 100)
            .execute(&mut *conn)
            .await
            .unwrap();
    }
}

/// Rollback-journal database with customers and their orders
pub async fn create_sample_db(path: &Path) {
    create_sample_db_with(path, 200, SqliteJournalMode::Delete).await;
}

pub async fn create_sample_db_with(path: &Path, customers: i64, journal_mode: SqliteJournalMode) {
    let mut conn = open(path, journal_mode, true).await;
    populate(&mut conn, customers).await;
    conn.close().await.unwrap();
}

/// Structurally sound database whose `orders` table has two orphaned rows
pub async fn create_db_with_fk_violation(path: &Path) {
    let mut conn = open(path, SqliteJournalMode::Delete, false).await;
    populate(&mut conn, 20).await;
    conn.execute("INSERT INTO orders (customer_id, total) VALUES (9001, 1), (9002, 2)")
        .await
        .unwrap();
    conn.close().await.unwrap();
}

/// Overwrite most of page `page` (1-based, 4096-byte pages) with garbage
pub fn corrupt_page(path: &Path, page: u64) {
    let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start((page - 1) * 4096 + 8)).unwrap();
    file.write_all(&[0xA5; 2048]).unwrap();
    file.sync_all().unwrap();
}

/// `(id, name)` of every customer, ordered by id
pub async fn customer_rows(path: &Path) -> Vec<(i64, String)> {
    let mut conn = SqliteConnection::connect_with(&crate::database::verify::read_only_options(path))
        .await
        .unwrap();
    let rows = sqlx::query("SELECT id, name FROM customers ORDER BY id")
        .fetch_all(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();
    rows.iter()
        .map(|row| (row.get::<i64, _>(0), row.get::<String, _>(1)))
        .collect()
}

pub fn assert_no_side_files(path: &Path) {
    for suffix in ["-wal", "-shm", "-journal"] {
        let side = with_name_suffix(path, suffix);
        assert!(!side.exists(), "unexpected side file {}", side.display());
    }
}
