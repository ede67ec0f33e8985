use std::sync::Arc;

use actix_web::error::BlockingError;
use actix_web::web;
use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use crate::actions;
use crate::models::{ActivityLog, ShareRecord};

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;
pub type DbConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DieselError),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::PoolError),

    #[error("download token already in use")]
    TokenConflict,

    #[error("blocking task was canceled")]
    Canceled,
}

/// Transactional persistence for share metadata. Implementations are
/// blocking; async callers go through [`run`].
pub trait MetadataStore: Send + Sync {
    fn is_registered_user(&self, email: &str) -> Result<bool, StoreError>;

    /// Inserts the record together with its token. A duplicate token yields
    /// `StoreError::TokenConflict` and nothing is written.
    fn insert_share(&self, record: &ShareRecord) -> Result<(), StoreError>;

    fn find_share(&self, share_id: &str) -> Result<Option<ShareRecord>, StoreError>;

    fn find_share_by_token(&self, token: &str) -> Result<Option<ShareRecord>, StoreError>;

    /// Clears the live token. Revoking an already revoked share is a no-op.
    fn revoke_share(&self, share_id: &str) -> Result<(), StoreError>;

    fn shares_sent_by(&self, uploader_id: &str) -> Result<Vec<ShareRecord>, StoreError>;

    /// Received shares paired with the sender's email.
    fn shares_received_by(
        &self,
        recipient_email: &str,
    ) -> Result<Vec<(ShareRecord, String)>, StoreError>;

    fn delete_user(&self, user_id: &str) -> Result<Option<Vec<ShareRecord>>, StoreError>;

    fn append_activity(&self, entry: &ActivityLog) -> Result<(), StoreError>;

    fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityLog>, StoreError>;
}

pub type SharedStore = Arc<dyn MetadataStore>;

/// Runs a store call on actix's blocking pool.
pub async fn run<F, T>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    web::block(f).await.map_err(|e| match e {
        BlockingError::Error(e) => e,
        BlockingError::Canceled => StoreError::Canceled,
    })
}

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        PgStore { pool }
    }

    fn conn(&self) -> Result<DbConnection, StoreError> {
        Ok(self.pool.get()?)
    }
}

impl MetadataStore for PgStore {
    fn is_registered_user(&self, email: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(actions::get_user_from_email(email, &conn)?.is_some())
    }

    fn insert_share(&self, record: &ShareRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        actions::insert_share_record(record, &conn).map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                StoreError::TokenConflict
            }
            e => StoreError::Database(e),
        })
    }

    fn find_share(&self, share_id: &str) -> Result<Option<ShareRecord>, StoreError> {
        let conn = self.conn()?;
        Ok(actions::get_share_record(share_id, &conn)?)
    }

    fn find_share_by_token(&self, token: &str) -> Result<Option<ShareRecord>, StoreError> {
        let conn = self.conn()?;
        Ok(actions::get_share_record_by_token(token, &conn)?)
    }

    fn revoke_share(&self, share_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        actions::revoke_share_record(share_id, &conn)?;
        Ok(())
    }

    fn shares_sent_by(&self, uploader_id: &str) -> Result<Vec<ShareRecord>, StoreError> {
        let conn = self.conn()?;
        Ok(actions::get_share_records_for_uploader(uploader_id, &conn)?)
    }

    fn shares_received_by(
        &self,
        recipient_email: &str,
    ) -> Result<Vec<(ShareRecord, String)>, StoreError> {
        let conn = self.conn()?;
        Ok(actions::get_share_records_for_recipient(
            recipient_email,
            &conn,
        )?)
    }

    fn delete_user(&self, user_id: &str) -> Result<Option<Vec<ShareRecord>>, StoreError> {
        let conn = self.conn()?;
        Ok(actions::delete_user_with_shares(user_id, &conn)?)
    }

    fn append_activity(&self, entry: &ActivityLog) -> Result<(), StoreError> {
        let conn = self.conn()?;
        Ok(actions::insert_activity_log(entry, &conn)?)
    }

    fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityLog>, StoreError> {
        let conn = self.conn()?;
        Ok(actions::get_recent_activity(limit, &conn)?)
    }
}

#[cfg(test)]
pub mod memory {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;

    use super::*;
    use crate::models::User;

    #[derive(Default)]
    struct Tables {
        users: Vec<User>,
        shares: Vec<ShareRecord>,
        activity: Vec<ActivityLog>,
    }

    /// In-process stand-in for PostgreSQL with failure injection.
    #[derive(Default)]
    pub struct MemoryStore {
        tables: Mutex<Tables>,
        fail_share_inserts: AtomicBool,
        pending_conflicts: AtomicUsize,
        held_insert: Mutex<Option<Receiver<()>>>,
        insert_waiting: AtomicBool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            MemoryStore::default()
        }

        pub fn add_user(&self, id: &str, email: &str, role: &str) {
            self.tables.lock().unwrap().users.push(User {
                id: id.to_string(),
                email: email.to_string(),
                role: role.to_string(),
                created_at: chrono::Utc::now().naive_utc(),
            });
        }

        pub fn fail_share_inserts(&self) {
            self.fail_share_inserts.store(true, Ordering::SeqCst);
        }

        /// The next share insert blocks until the returned sender is used or
        /// dropped, then fails.
        pub fn hold_next_insert(&self) -> Sender<()> {
            let (release, held) = mpsc::channel();
            *self.held_insert.lock().unwrap() = Some(held);
            release
        }

        pub fn insert_waiting(&self) -> bool {
            self.insert_waiting.load(Ordering::SeqCst)
        }

        /// The next `n` share inserts report a token collision.
        pub fn conflict_next_inserts(&self, n: usize) {
            self.pending_conflicts.store(n, Ordering::SeqCst);
        }

        pub fn shares(&self) -> Vec<ShareRecord> {
            self.tables.lock().unwrap().shares.clone()
        }

        pub fn activity(&self) -> Vec<ActivityLog> {
            self.tables.lock().unwrap().activity.clone()
        }

        pub fn expire_share(&self, share_id: &str, at: chrono::NaiveDateTime) {
            let mut tables = self.tables.lock().unwrap();
            for share in tables.shares.iter_mut().filter(|s| s.id == share_id) {
                share.token_expires_at = Some(at);
            }
        }
    }

    impl MetadataStore for MemoryStore {
        fn is_registered_user(&self, email: &str) -> Result<bool, StoreError> {
            let tables = self.tables.lock().unwrap();
            Ok(tables.users.iter().any(|u| u.email == email))
        }

        fn insert_share(&self, record: &ShareRecord) -> Result<(), StoreError> {
            let held = self.held_insert.lock().unwrap().take();
            if let Some(held) = held {
                self.insert_waiting.store(true, Ordering::SeqCst);
                let _ = held.recv();
                return Err(StoreError::Database(DieselError::RollbackTransaction));
            }
            if self.fail_share_inserts.load(Ordering::SeqCst) {
                return Err(StoreError::Database(DieselError::RollbackTransaction));
            }
            let conflicts = self.pending_conflicts.load(Ordering::SeqCst);
            if conflicts > 0 {
                self.pending_conflicts.store(conflicts - 1, Ordering::SeqCst);
                return Err(StoreError::TokenConflict);
            }

            let mut tables = self.tables.lock().unwrap();
            let clash = tables.shares.iter().any(|s| {
                record.download_token.is_some()
                    && (s.download_token == record.download_token
                        || s.revoked_token == record.download_token)
            });
            if clash {
                return Err(StoreError::TokenConflict);
            }
            tables.shares.push(record.clone());
            Ok(())
        }

        fn find_share(&self, share_id: &str) -> Result<Option<ShareRecord>, StoreError> {
            let tables = self.tables.lock().unwrap();
            Ok(tables.shares.iter().find(|s| s.id == share_id).cloned())
        }

        fn find_share_by_token(&self, token: &str) -> Result<Option<ShareRecord>, StoreError> {
            let tables = self.tables.lock().unwrap();
            Ok(tables
                .shares
                .iter()
                .find(|s| {
                    s.download_token.as_deref() == Some(token)
                        || s.revoked_token.as_deref() == Some(token)
                })
                .cloned())
        }

        fn revoke_share(&self, share_id: &str) -> Result<(), StoreError> {
            let mut tables = self.tables.lock().unwrap();
            for share in tables
                .shares
                .iter_mut()
                .filter(|s| s.id == share_id && s.download_token.is_some())
            {
                share.revoked_token = share.download_token.take();
                share.token_expires_at = None;
            }
            Ok(())
        }

        fn shares_sent_by(&self, uploader_id: &str) -> Result<Vec<ShareRecord>, StoreError> {
            let tables = self.tables.lock().unwrap();
            let mut found: Vec<ShareRecord> = tables
                .shares
                .iter()
                .filter(|s| s.uploader_id == uploader_id)
                .cloned()
                .collect();
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(found)
        }

        fn shares_received_by(
            &self,
            recipient_email: &str,
        ) -> Result<Vec<(ShareRecord, String)>, StoreError> {
            let tables = self.tables.lock().unwrap();
            let mut found: Vec<(ShareRecord, String)> = tables
                .shares
                .iter()
                .filter(|s| s.recipient_email == recipient_email)
                .filter_map(|s| {
                    let sender = tables.users.iter().find(|u| u.id == s.uploader_id)?;
                    Some((s.clone(), sender.email.clone()))
                })
                .collect();
            found.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
            Ok(found)
        }

        fn delete_user(&self, user_id: &str) -> Result<Option<Vec<ShareRecord>>, StoreError> {
            let mut tables = self.tables.lock().unwrap();
            if !tables.users.iter().any(|u| u.id == user_id) {
                return Ok(None);
            }
            tables.users.retain(|u| u.id != user_id);
            let (owned, kept): (Vec<ShareRecord>, Vec<ShareRecord>) = tables
                .shares
                .drain(..)
                .partition(|s| s.uploader_id == user_id);
            tables.shares = kept;
            Ok(Some(owned))
        }

        fn append_activity(&self, entry: &ActivityLog) -> Result<(), StoreError> {
            self.tables.lock().unwrap().activity.push(entry.clone());
            Ok(())
        }

        fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityLog>, StoreError> {
            let tables = self.tables.lock().unwrap();
            Ok(tables
                .activity
                .iter()
                .rev()
                .take(limit.max(0) as usize)
                .cloned()
                .collect())
        }
    }

    mod tests {
        use super::*;
        use crate::models::sample_record;

        #[test]
        fn test_revoke_moves_token_and_is_idempotent() {
            let store = MemoryStore::new();
            store.insert_share(&sample_record(Some("tok"), None)).unwrap();

            store.revoke_share("share-1").unwrap();
            store.revoke_share("share-1").unwrap();

            let share = store.find_share("share-1").unwrap().unwrap();
            assert_eq!(share.download_token, None);
            assert_eq!(share.revoked_token.as_deref(), Some("tok"));
            assert!(store.find_share_by_token("tok").unwrap().is_some());
        }

        #[test]
        fn test_duplicate_token_is_a_conflict() {
            let store = MemoryStore::new();
            store.insert_share(&sample_record(Some("tok"), None)).unwrap();
            let mut other = sample_record(Some("tok"), None);
            other.id = "share-2".to_string();
            assert!(matches!(
                store.insert_share(&other),
                Err(StoreError::TokenConflict)
            ));
            assert_eq!(store.shares().len(), 1);
        }
    }
}
