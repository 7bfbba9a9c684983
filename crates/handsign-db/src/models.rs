/// Database row types — these map directly to SQLite rows.
/// Distinct from handsign-types models to keep the DB layer independent.

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub telegram_id: i64,
    pub display_name: String,
    pub role: String,
    pub verification_status: String,
    pub gesture: Option<String>,
    pub rejection_reason: Option<String>,
    pub verified_by: Option<String>,
    pub created_at: String,
    pub submitted_at: Option<String>,
    pub verified_at: Option<String>,
    pub reviewed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestRow {
    pub id: String,
    pub user_id: String,
    pub gesture: String,
    pub photo_ref: Option<String>,
    pub photo_file_id: Option<String>,
    pub status: String,
    pub created_at: String,
    pub submitted_at: Option<String>,
    pub reviewed_at: Option<String>,
    pub reviewer_id: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Outcome of an insert guarded by a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A unique constraint rejected the row: a duplicate telegram id, or a second
    /// pending request for the same user.
    Conflict,
}
