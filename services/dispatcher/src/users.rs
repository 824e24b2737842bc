//! User-record store: a read cache and striped per-user locks over the
//! SQLite repository.
//!
//! Reads degrade open: when the repository is unavailable the caller gets a
//! transient default record and routing continues.  Writes fail loudly so a
//! `/style select` that did not persist is reported to the user.

use crate::db::{Db, DbError, UserRecord};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

const LOCK_STRIPES: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("repository unavailable: {0}")]
    Unavailable(#[from] DbError),
}

pub struct UserStore {
    db: Arc<Mutex<Db>>,
    cache: RwLock<HashMap<i64, UserRecord>>,
    /// Write operations for a user serialize on `stripes[qq_id % LOCK_STRIPES]`.
    stripes: Vec<Mutex<()>>,
}

impl UserStore {
    pub fn new(db: Db) -> Self {
        UserStore {
            db: Arc::new(Mutex::new(db)),
            cache: RwLock::new(HashMap::new()),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, qq_id: i64) -> &Mutex<()> {
        &self.stripes[(qq_id.unsigned_abs() as usize) % LOCK_STRIPES]
    }

    /// Fetch the record for `qq_id`, creating it on first sighting.
    ///
    /// A repository failure yields a transient default record (logged at
    /// WARN) rather than blocking routing.
    pub async fn get_or_create(&self, qq_id: i64) -> UserRecord {
        if let Some(user) = self.cache.read().await.get(&qq_id) {
            return user.clone();
        }
        let _guard = self.stripe(qq_id).lock().await;
        if let Some(user) = self.cache.read().await.get(&qq_id) {
            return user.clone();
        }
        let db = self.db.lock().await;
        let user = match db.load_user(qq_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                let user = UserRecord::new(qq_id);
                if let Err(e) = db.save_user(&user) {
                    warn!(qq_id, error = %e, "could not persist new user record");
                }
                user
            }
            Err(e) => {
                warn!(qq_id, error = %e, "repository read failed, using transient record");
                return UserRecord::new(qq_id);
            }
        };
        drop(db);
        self.cache.write().await.insert(qq_id, user.clone());
        user
    }

    /// Set the selected style for one category.
    ///
    /// The caller has already validated that the set belongs to the category
    /// and is enabled.  Lock, persist, then update the cache so the next
    /// message from this user observes the new selection.
    pub async fn select_style(
        &self,
        qq_id: i64,
        category_id: &str,
        set_id: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.stripe(qq_id).lock().await;
        let db = self.db.lock().await;
        let mut user = db.load_user(qq_id)?.unwrap_or_else(|| UserRecord::new(qq_id));
        user.selected_styles
            .insert(category_id.to_owned(), set_id.to_owned());
        db.save_user(&user)?;
        drop(db);
        self.cache.write().await.insert(qq_id, user);
        Ok(())
    }

    /// Record the nickname seen on a message event.  Best-effort: a
    /// repository failure is logged and swallowed.
    pub async fn note_nickname(&self, qq_id: i64, nickname: &str) {
        {
            let cache = self.cache.read().await;
            if cache
                .get(&qq_id)
                .is_some_and(|u| u.nickname.as_deref() == Some(nickname))
            {
                return;
            }
        }
        let _guard = self.stripe(qq_id).lock().await;
        let db = self.db.lock().await;
        let mut user = match db.load_user(qq_id) {
            Ok(Some(user)) => user,
            Ok(None) => UserRecord::new(qq_id),
            Err(e) => {
                warn!(qq_id, error = %e, "nickname update skipped");
                return;
            }
        };
        if user.nickname.as_deref() == Some(nickname) {
            return;
        }
        user.nickname = Some(nickname.to_owned());
        if let Err(e) = db.save_user(&user) {
            warn!(qq_id, error = %e, "nickname update failed");
            return;
        }
        drop(db);
        self.cache.write().await.insert(qq_id, user);
    }

    /// Grant or revoke the persisted privilege flag.
    pub async fn set_privileged(&self, qq_id: i64, privileged: bool) -> Result<(), StoreError> {
        let _guard = self.stripe(qq_id).lock().await;
        let db = self.db.lock().await;
        let mut user = db.load_user(qq_id)?.unwrap_or_else(|| UserRecord::new(qq_id));
        user.is_privileged = privileged;
        db.save_user(&user)?;
        drop(db);
        self.cache.write().await.insert(qq_id, user);
        Ok(())
    }
}
