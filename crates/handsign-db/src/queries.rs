use crate::models::{InsertOutcome, RequestRow, UserRow};
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, ErrorCode, Row, params};

const USER_COLUMNS: &str = "id, telegram_id, display_name, role, verification_status, gesture, \
     rejection_reason, verified_by, created_at, submitted_at, verified_at, reviewed_at";

const REQUEST_COLUMNS: &str = "id, user_id, gesture, photo_ref, photo_file_id, status, \
     created_at, submitted_at, reviewed_at, reviewer_id, rejection_reason";

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        telegram_id: i64,
        display_name: &str,
        role: &str,
        created_at: &str,
    ) -> Result<InsertOutcome> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, telegram_id, display_name, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, telegram_id, display_name, role, created_at],
            );
            constraint_outcome(inserted)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", &id))
    }

    pub fn get_user_by_telegram_id(&self, telegram_id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "telegram_id = ?1", &telegram_id))
    }

    pub fn update_display_name(&self, id: &str, display_name: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users SET display_name = ?2 WHERE id = ?1",
                params![id, display_name],
            )?;
            Ok(n)
        })
    }

    /// Insert or promote a user to admin. Used for bootstrap from configuration.
    pub fn ensure_admin(
        &self,
        id: &str,
        telegram_id: i64,
        display_name: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, telegram_id, display_name, role, created_at)
                 VALUES (?1, ?2, ?3, 'admin', ?4)
                 ON CONFLICT(telegram_id) DO UPDATE SET role = 'admin'",
                params![id, telegram_id, display_name, created_at],
            )?;
            Ok(())
        })
    }

    /// Staff and admins with a transport identity.
    pub fn list_privileged_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE role IN ('staff', 'admin') AND telegram_id IS NOT NULL
                 ORDER BY created_at"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Verification requests --

    pub fn get_request(&self, id: &str) -> Result<Option<RequestRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {REQUEST_COLUMNS} FROM verification_requests WHERE id = ?1");
            conn.query_row(&sql, [id], request_from_row).optional()
        })
    }

    pub fn get_pending_request(&self, user_id: &str) -> Result<Option<RequestRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM verification_requests
                 WHERE user_id = ?1 AND status = 'pending'"
            );
            conn.query_row(&sql, [user_id], request_from_row).optional()
        })
    }

    pub fn get_latest_request(&self, user_id: &str) -> Result<Option<RequestRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM verification_requests
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1"
            );
            conn.query_row(&sql, [user_id], request_from_row).optional()
        })
    }

    /// Pending requests that already carry a photo, oldest submission first.
    pub fn list_submitted_pending(&self, limit: u32) -> Result<Vec<RequestRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM verification_requests
                 WHERE status = 'pending' AND photo_ref IS NOT NULL
                 ORDER BY submitted_at ASC
                 LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit], request_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Create a pending request and move the user to `pending` in one transaction.
    /// The partial unique index rejects a second pending request for the same user.
    pub fn insert_request(
        &self,
        id: &str,
        user_id: &str,
        gesture: &str,
        created_at: &str,
    ) -> Result<InsertOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT INTO verification_requests (id, user_id, gesture, status, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![id, user_id, gesture, created_at],
            );
            if constraint_outcome(inserted)? == InsertOutcome::Conflict {
                return Ok(InsertOutcome::Conflict);
            }

            tx.execute(
                "UPDATE users
                 SET verification_status = 'pending', gesture = ?2,
                     rejection_reason = NULL, submitted_at = NULL
                 WHERE id = ?1",
                params![user_id, gesture],
            )?;

            tx.commit()?;
            Ok(InsertOutcome::Inserted)
        })
    }

    /// Attach a photo to a request that is still pending. Returns affected rows.
    pub fn attach_photo_if_pending(
        &self,
        id: &str,
        photo_ref: &str,
        photo_file_id: Option<&str>,
        submitted_at: &str,
    ) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let n = tx.execute(
                "UPDATE verification_requests
                 SET photo_ref = ?2, photo_file_id = ?3, submitted_at = ?4
                 WHERE id = ?1 AND status = 'pending'",
                params![id, photo_ref, photo_file_id, submitted_at],
            )?;
            if n == 1 {
                tx.execute(
                    "UPDATE users SET submitted_at = ?2
                     WHERE id = (SELECT user_id FROM verification_requests WHERE id = ?1)",
                    params![id, submitted_at],
                )?;
            }
            tx.commit()?;
            Ok(n)
        })
    }

    /// Approve a pending request and mark its owner verified. Returns affected rows;
    /// zero means the request was no longer pending.
    pub fn approve_if_pending(
        &self,
        id: &str,
        reviewer_id: &str,
        reviewed_at: &str,
    ) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let n = tx.execute(
                "UPDATE verification_requests
                 SET status = 'approved', reviewed_at = ?3, reviewer_id = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, reviewer_id, reviewed_at],
            )?;
            if n == 1 {
                tx.execute(
                    "UPDATE users
                     SET verification_status = 'verified', verified_at = ?3, reviewed_at = ?3,
                         verified_by = ?2, rejection_reason = NULL
                     WHERE id = (SELECT user_id FROM verification_requests WHERE id = ?1)",
                    params![id, reviewer_id, reviewed_at],
                )?;
            }
            tx.commit()?;
            Ok(n)
        })
    }

    /// Reject a pending request with a reason, mirrored onto the owner.
    pub fn reject_if_pending(
        &self,
        id: &str,
        reviewer_id: &str,
        reason: &str,
        reviewed_at: &str,
    ) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let n = tx.execute(
                "UPDATE verification_requests
                 SET status = 'rejected', reviewed_at = ?4, reviewer_id = ?2, rejection_reason = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id, reviewer_id, reason, reviewed_at],
            )?;
            if n == 1 {
                tx.execute(
                    "UPDATE users
                     SET verification_status = 'rejected', rejection_reason = ?2, reviewed_at = ?3
                     WHERE id = (SELECT user_id FROM verification_requests WHERE id = ?1)",
                    params![id, reason, reviewed_at],
                )?;
            }
            tx.commit()?;
            Ok(n)
        })
    }
}

fn constraint_outcome(result: rusqlite::Result<usize>) -> Result<InsertOutcome> {
    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Ok(InsertOutcome::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

fn query_user(
    conn: &Connection,
    clause: &str,
    param: &dyn rusqlite::ToSql,
) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {clause}");
    conn.query_row(&sql, [param], user_from_row).optional()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        telegram_id: row.get(1)?,
        display_name: row.get(2)?,
        role: row.get(3)?,
        verification_status: row.get(4)?,
        gesture: row.get(5)?,
        rejection_reason: row.get(6)?,
        verified_by: row.get(7)?,
        created_at: row.get(8)?,
        submitted_at: row.get(9)?,
        verified_at: row.get(10)?,
        reviewed_at: row.get(11)?,
    })
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok(RequestRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        gesture: row.get(2)?,
        photo_ref: row.get(3)?,
        photo_file_id: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        submitted_at: row.get(7)?,
        reviewed_at: row.get(8)?,
        reviewer_id: row.get(9)?,
        rejection_reason: row.get(10)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
