use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (users, verification requests)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id                   TEXT PRIMARY KEY,
                telegram_id          INTEGER NOT NULL UNIQUE,
                display_name         TEXT NOT NULL,
                role                 TEXT NOT NULL DEFAULT 'user',
                verification_status  TEXT NOT NULL DEFAULT 'none',
                gesture              TEXT,
                rejection_reason     TEXT,
                verified_by          TEXT REFERENCES users(id),
                created_at           TEXT NOT NULL,
                submitted_at         TEXT,
                verified_at          TEXT,
                reviewed_at          TEXT
            );

            CREATE INDEX idx_users_role ON users(role);

            CREATE TABLE verification_requests (
                id                TEXT PRIMARY KEY,
                user_id           TEXT NOT NULL REFERENCES users(id),
                gesture           TEXT NOT NULL,
                photo_ref         TEXT,
                photo_file_id     TEXT,
                status            TEXT NOT NULL DEFAULT 'pending',
                created_at        TEXT NOT NULL,
                submitted_at      TEXT,
                reviewed_at       TEXT,
                reviewer_id       TEXT REFERENCES users(id),
                rejection_reason  TEXT
            );

            CREATE INDEX idx_requests_user_status
                ON verification_requests(user_id, status);

            -- At most one pending request per user
            CREATE UNIQUE INDEX idx_requests_one_pending
                ON verification_requests(user_id) WHERE status = 'pending';

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
