use std::sync::Arc;
use std::time::Duration;

use crate::auth::SessionManager;
use crate::error::{AppError, AppResult};
use crate::feed::FeedStore;
use crate::interactions::InteractionTracker;
use crate::locks::KeyedLocks;
use crate::models::{Post, PostId};
use crate::remote::{DynRemote, Gateway};
use crate::upload::{UploadFile, UploadMode, UploadPipeline};

/// Knobs shared by every store in a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    pub bucket: String,
    pub cache_control_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            bucket: "petagram".to_string(),
            cache_control_secs: 3600,
        }
    }
}

/// Everything one UI session needs, wired to a single remote.
#[derive(Clone)]
pub struct AppContext {
    pub session: Arc<SessionManager>,
    pub feed: Arc<FeedStore>,
    pub interactions: Arc<InteractionTracker>,
    pub uploads: Arc<UploadPipeline>,
}

impl AppContext {
    pub fn new(remote: DynRemote, settings: ClientSettings) -> Self {
        let gateway = Gateway::new(remote, settings.request_timeout);
        // delete and add-comment for one post queue on the same lock
        let post_locks = Arc::new(KeyedLocks::new());

        let session = Arc::new(SessionManager::new(gateway.clone()));
        let feed = Arc::new(FeedStore::new(
            gateway.clone(),
            Arc::clone(&session),
            Arc::clone(&post_locks),
        ));
        let interactions = Arc::new(InteractionTracker::new(
            gateway.clone(),
            Arc::clone(&session),
            Arc::clone(&feed),
            post_locks,
        ));
        let uploads = Arc::new(UploadPipeline::new(
            gateway,
            Arc::clone(&session),
            settings.bucket,
            settings.cache_control_secs,
        ));

        Self {
            session,
            feed,
            interactions,
            uploads,
        }
    }

    /// Load the feed and, when signed in, the hearted set, concurrently.
    pub async fn hydrate(&self) -> AppResult<()> {
        match self.session.current_session() {
            Some(session) => {
                // both loads run to completion even when one fails
                let (posts, hearted) = futures::join!(
                    self.feed.load_all(),
                    self.interactions.load_hearted(&session.user_id)
                );
                posts?;
                hearted?;
            }
            None => {
                self.feed.load_all().await?;
            }
        }
        Ok(())
    }

    /// Upload an image and create a post pointing at it.
    pub async fn publish(&self, file: UploadFile, caption: &str) -> AppResult<Post> {
        let url = self.uploads.upload(file, UploadMode::NewPost).await?;
        self.feed.create(&url, caption).await
    }

    /// Delete a post and drop its hearts and thread from local state. On a
    /// partial failure only the stages the remote committed are mirrored.
    pub async fn delete_post(&self, post_id: PostId) -> AppResult<()> {
        match self.feed.delete(post_id).await {
            Ok(()) => {
                self.interactions.forget_post(post_id);
                Ok(())
            }
            Err(err) => {
                if let AppError::Delete { completed, .. } = &err {
                    self.interactions.mirror_delete(post_id, completed);
                }
                Err(err)
            }
        }
    }

    /// Sign out and clear every store. Local state is cleared even when the
    /// remote sign-out fails.
    pub async fn logout(&self) -> AppResult<()> {
        let result = self.session.logout().await;
        self.feed.reset();
        self.interactions.reset();
        result
    }
}
