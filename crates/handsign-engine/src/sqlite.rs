use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use handsign_db::Database;
use handsign_db::models::{InsertOutcome, RequestRow, UserRow};
use handsign_types::models::{RequestStatus, Role, User, VerificationRequest, VerificationStatus};

use crate::error::{StoreError, StoreResult};
use crate::ports::{CreateRequestOutcome, NewUser, RequestUpdate, Store, UserUpdate};

/// `Store` over the SQLite database. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Backend(anyhow::anyhow!("blocking task failed: {}", e))
            })?
            .map_err(StoreError::Backend)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_user_by_identity(&self, telegram_id: i64) -> StoreResult<Option<User>> {
        let row = self
            .blocking(move |db| db.get_user_by_telegram_id(telegram_id))
            .await?;
        row.map(user_from_row).transpose()
    }

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let row = self
            .blocking(move |db| db.get_user_by_id(&id.to_string()))
            .await?;
        row.map(user_from_row).transpose()
    }

    async fn create_user(&self, new_user: NewUser) -> StoreResult<User> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let (telegram_id, role) = (new_user.telegram_id, new_user.role);
        let name = new_user.display_name.clone();
        let stamp = timestamp(created_at);

        let outcome = self
            .blocking(move |db| {
                db.create_user(&id.to_string(), telegram_id, &name, role.as_str(), &stamp)
            })
            .await?;
        if outcome == InsertOutcome::Conflict {
            let taken = format!("telegram id {} already registered", telegram_id);
            return Err(StoreError::Conflict(taken));
        }

        Ok(User {
            id,
            telegram_id,
            display_name: new_user.display_name,
            role,
            verification_status: VerificationStatus::None,
            gesture: None,
            rejection_reason: None,
            verified_by: None,
            created_at,
            submitted_at: None,
            verified_at: None,
            reviewed_at: None,
        })
    }

    async fn update_user(&self, id: Uuid, update: UserUpdate) -> StoreResult<()> {
        if let Some(name) = update.display_name {
            self.blocking(move |db| db.update_display_name(&id.to_string(), &name))
                .await?;
        }
        Ok(())
    }

    async fn find_pending_request_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Option<VerificationRequest>> {
        let row = self
            .blocking(move |db| db.get_pending_request(&user_id.to_string()))
            .await?;
        row.map(request_from_row).transpose()
    }

    async fn find_latest_request_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Option<VerificationRequest>> {
        let row = self
            .blocking(move |db| db.get_latest_request(&user_id.to_string()))
            .await?;
        row.map(request_from_row).transpose()
    }

    async fn find_request(&self, id: Uuid) -> StoreResult<Option<VerificationRequest>> {
        let row = self.blocking(move |db| db.get_request(&id.to_string())).await?;
        row.map(request_from_row).transpose()
    }

    async fn create_verification_request(
        &self,
        user_id: Uuid,
        gesture: &str,
    ) -> StoreResult<CreateRequestOutcome> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let stamp = timestamp(created_at);
        let gesture_owned = gesture.to_string();

        let outcome = self
            .blocking(move |db| {
                db.insert_request(&id.to_string(), &user_id.to_string(), &gesture_owned, &stamp)
            })
            .await?;
        if outcome == InsertOutcome::Conflict {
            return Ok(CreateRequestOutcome::PendingExists);
        }

        Ok(CreateRequestOutcome::Created(VerificationRequest {
            id,
            user_id,
            gesture: gesture.to_string(),
            photo_ref: None,
            photo_file_id: None,
            status: RequestStatus::Pending,
            created_at,
            submitted_at: None,
            reviewed_at: None,
            reviewer_id: None,
            rejection_reason: None,
        }))
    }

    async fn update_verification_request_if_status(
        &self,
        id: Uuid,
        expected: RequestStatus,
        update: RequestUpdate,
    ) -> StoreResult<u64> {
        // Resolved requests are immutable, so there is nothing to match.
        if expected != RequestStatus::Pending {
            debug!(request_id = %id, "Conditional update on {} request ignored", expected.as_str());
            return Ok(0);
        }

        let id = id.to_string();
        let rows = match update {
            RequestUpdate::AttachPhoto {
                photo_ref,
                photo_file_id,
                submitted_at,
            } => {
                let stamp = timestamp(submitted_at);
                self.blocking(move |db| {
                    db.attach_photo_if_pending(&id, &photo_ref, photo_file_id.as_deref(), &stamp)
                })
                .await?
            }
            RequestUpdate::Approve {
                reviewer_id,
                reviewed_at,
            } => {
                let stamp = timestamp(reviewed_at);
                let reviewer_id = reviewer_id.to_string();
                self.blocking(move |db| db.approve_if_pending(&id, &reviewer_id, &stamp))
                    .await?
            }
            RequestUpdate::Reject {
                reviewer_id,
                reason,
                reviewed_at,
            } => {
                let stamp = timestamp(reviewed_at);
                let reviewer_id = reviewer_id.to_string();
                self.blocking(move |db| db.reject_if_pending(&id, &reviewer_id, &reason, &stamp))
                    .await?
            }
        };
        Ok(rows as u64)
    }

    async fn list_privileged_users(&self) -> StoreResult<Vec<User>> {
        let rows = self.blocking(|db| db.list_privileged_users()).await?;
        rows.into_iter().map(user_from_row).collect()
    }

    async fn list_pending_requests(&self, limit: u32) -> StoreResult<Vec<VerificationRequest>> {
        let rows = self
            .blocking(move |db| db.list_submitted_pending(limit))
            .await?;
        rows.into_iter().map(request_from_row).collect()
    }
}

// -- Row conversion --

/// Fixed-width RFC 3339 so stored timestamps sort as text.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_opt_time(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad id {:?}: {}", s, e)))
}

fn user_from_row(row: UserRow) -> StoreResult<User> {
    Ok(User {
        id: parse_uuid(&row.id)?,
        telegram_id: row.telegram_id,
        role: Role::parse(&row.role)
            .ok_or_else(|| StoreError::Corrupt(format!("bad role {:?}", row.role)))?,
        verification_status: VerificationStatus::parse(&row.verification_status).ok_or_else(|| {
            StoreError::Corrupt(format!("bad verification status {:?}", row.verification_status))
        })?,
        verified_by: row.verified_by.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_time(&row.created_at)?,
        submitted_at: parse_opt_time(row.submitted_at)?,
        verified_at: parse_opt_time(row.verified_at)?,
        reviewed_at: parse_opt_time(row.reviewed_at)?,
        display_name: row.display_name,
        gesture: row.gesture,
        rejection_reason: row.rejection_reason,
    })
}

fn request_from_row(row: RequestRow) -> StoreResult<VerificationRequest> {
    Ok(VerificationRequest {
        id: parse_uuid(&row.id)?,
        user_id: parse_uuid(&row.user_id)?,
        status: RequestStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("bad request status {:?}", row.status)))?,
        reviewer_id: row.reviewer_id.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_time(&row.created_at)?,
        submitted_at: parse_opt_time(row.submitted_at)?,
        reviewed_at: parse_opt_time(row.reviewed_at)?,
        gesture: row.gesture,
        photo_ref: row.photo_ref,
        photo_file_id: row.photo_file_id,
        rejection_reason: row.rejection_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn new_user(telegram_id: i64, role: Role) -> NewUser {
        NewUser {
            telegram_id,
            display_name: format!("user-{}", telegram_id),
            role,
        }
    }

    #[tokio::test]
    async fn users_round_trip_and_conflict() {
        let store = store();
        let created = store.create_user(new_user(100, Role::User)).await.unwrap();

        let found = store.find_user_by_identity(100).await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.verification_status, VerificationStatus::None);
        assert_eq!(found.created_at, created.created_at);

        let again = store.create_user(new_user(100, Role::User)).await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));

        store
            .update_user(
                created.id,
                UserUpdate {
                    display_name: Some("Renamed".into()),
                },
            )
            .await
            .unwrap();
        let renamed = store.find_user_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(renamed.display_name, "Renamed");
    }

    #[tokio::test]
    async fn conditional_updates_mirror_the_user() {
        let store = store();
        let reviewer = store.create_user(new_user(900, Role::Staff)).await.unwrap();
        let user = store.create_user(new_user(100, Role::User)).await.unwrap();

        let CreateRequestOutcome::Created(request) =
            store.create_verification_request(user.id, "👍 (thumbs up)").await.unwrap()
        else {
            panic!("expected a new request");
        };
        assert!(matches!(
            store.create_verification_request(user.id, "👌 (OK sign)").await.unwrap(),
            CreateRequestOutcome::PendingExists
        ));

        let attach = RequestUpdate::AttachPhoto {
            photo_ref: "ab".repeat(32),
            photo_file_id: Some("tg-file".into()),
            submitted_at: Utc::now(),
        };
        assert_eq!(
            store
                .update_verification_request_if_status(request.id, RequestStatus::Pending, attach)
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.list_pending_requests(10).await.unwrap().len(), 1);

        let approve = RequestUpdate::Approve {
            reviewer_id: reviewer.id,
            reviewed_at: Utc::now(),
        };
        assert_eq!(
            store
                .update_verification_request_if_status(
                    request.id,
                    RequestStatus::Pending,
                    approve.clone()
                )
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .update_verification_request_if_status(request.id, RequestStatus::Pending, approve)
                .await
                .unwrap(),
            0
        );

        let user = store.find_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(user.verification_status, VerificationStatus::Verified);
        assert_eq!(user.verified_by, Some(reviewer.id));
        let latest = store.find_latest_request_for_user(user.id).await.unwrap().unwrap();
        assert_eq!(latest.status, RequestStatus::Approved);
        assert!(store.find_pending_request_for_user(user.id).await.unwrap().is_none());
        assert!(store.list_pending_requests(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn privileged_users_exclude_customers() {
        let store = store();
        store.create_user(new_user(1, Role::Admin)).await.unwrap();
        store.create_user(new_user(2, Role::Staff)).await.unwrap();
        store.create_user(new_user(3, Role::User)).await.unwrap();

        let reviewers = store.list_privileged_users().await.unwrap();
        assert_eq!(reviewers.len(), 2);
        assert!(reviewers.iter().all(|u| u.role.is_privileged()));
    }
}
