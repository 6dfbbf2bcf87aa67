use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

use super::mutation::MutationState;
use crate::auth::SessionManager;
use crate::error::{AppError, AppResult, CallError, DeleteStage};
use crate::locks::KeyedLocks;
use crate::models::{Post, PostId, Session, UserId};
use crate::remote::{row, Filter, Gateway, RemoteError, Select};

pub const POSTS: &str = "posts";
pub const HEARTS: &str = "hearts";
pub const COMMENTS: &str = "comments";

/// A post shown before the remote has confirmed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionalPost {
    pub correlation_id: Uuid,
    pub author_id: UserId,
    pub image_url: String,
    pub caption: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEntry {
    Pending(ProvisionalPost),
    Committed(Post),
}

impl FeedEntry {
    pub fn post_id(&self) -> Option<PostId> {
        match self {
            Self::Committed(post) => Some(post.id),
            Self::Pending(_) => None,
        }
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::Pending(p) => Some(p.correlation_id),
            Self::Committed(_) => None,
        }
    }

    pub fn caption(&self) -> &str {
        match self {
            Self::Pending(p) => &p.caption,
            Self::Committed(post) => &post.caption,
        }
    }

    pub fn as_post(&self) -> Option<&Post> {
        match self {
            Self::Committed(post) => Some(post),
            Self::Pending(_) => None,
        }
    }
}

/// Everything a feed view renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    pub entries: Vec<FeedEntry>,
    pub is_loading: bool,
}

impl FeedSnapshot {
    pub fn posts(&self) -> Vec<Post> {
        self.entries
            .iter()
            .filter_map(FeedEntry::as_post)
            .cloned()
            .collect()
    }

    fn position_of(&self, post_id: PostId) -> Option<usize> {
        self.entries.iter().position(|e| e.post_id() == Some(post_id))
    }
}

/// Ordered posts with their aggregate counts.
///
/// Creates are optimistic: a provisional entry is prepended, then replaced by
/// correlation id once the remote answers (or removed if it refuses).
/// Deletes are staged and not atomic, see [`FeedStore::delete`].
pub struct FeedStore {
    gateway: Gateway,
    session: Arc<SessionManager>,
    post_locks: Arc<KeyedLocks<PostId>>,
    state: watch::Sender<FeedSnapshot>,
    mutations: Mutex<HashMap<Uuid, MutationState>>,
}

impl FeedStore {
    pub fn new(
        gateway: Gateway,
        session: Arc<SessionManager>,
        post_locks: Arc<KeyedLocks<PostId>>,
    ) -> Self {
        let (state, _) = watch::channel(FeedSnapshot::default());
        Self {
            gateway,
            session,
            post_locks,
            state,
            mutations: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.state.borrow().clone()
    }

    pub fn entries(&self) -> Vec<FeedEntry> {
        self.state.borrow().entries.clone()
    }

    /// Committed posts in display order.
    pub fn posts(&self) -> Vec<Post> {
        self.state.borrow().posts()
    }

    pub fn post(&self, post_id: PostId) -> Option<Post> {
        let state = self.state.borrow();
        state
            .position_of(post_id)
            .and_then(|i| state.entries[i].as_post().cloned())
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    /// Last known state of a create, by correlation id.
    pub fn mutation(&self, correlation_id: Uuid) -> Option<MutationState> {
        self.mutations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&correlation_id)
            .cloned()
    }

    fn record(&self, correlation_id: Uuid, state: MutationState) {
        self.mutations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id, state);
    }

    /// Replace the committed posts with the remote's, newest first.
    /// Creates still in flight stay at the front.
    pub async fn load_all(&self) -> AppResult<Vec<Post>> {
        let loading = LoadingFlag::raise(&self.state);
        let result = self.fetch_posts().await;
        drop(loading);
        let posts = result?;

        self.state.send_modify(|s| {
            let mut entries: Vec<FeedEntry> = s
                .entries
                .drain(..)
                .filter(|e| matches!(e, FeedEntry::Pending(_)))
                .collect();
            entries.extend(posts.iter().cloned().map(FeedEntry::Committed));
            s.entries = entries;
        });
        self.mutations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, state| !state.is_terminal());

        tracing::debug!("Loaded {} posts", posts.len());
        Ok(posts)
    }

    async fn fetch_posts(&self) -> AppResult<Vec<Post>> {
        let query = Select::from(POSTS)
            .count_of(HEARTS, "post_id")
            .count_of(COMMENTS, "post_id")
            .order_desc("created_at")
            .order_desc("id");

        let remote = self.gateway.remote();
        let rows = self.gateway.call("posts.select", remote.select(query)).await?;
        rows.into_iter()
            .map(|r| Post::from_row(r).map_err(AppError::from))
            .collect()
    }

    pub async fn create(&self, image_url: &str, caption: &str) -> AppResult<Post> {
        let session = self.session.require()?;
        if image_url.trim().is_empty() {
            return Err(AppError::Validation("image url must not be empty".to_string()));
        }

        let correlation_id = Uuid::new_v4();
        let now = Utc::now();
        let pending = MutationState::Idle.begin(now)?;
        self.record(correlation_id, pending.clone());

        let provisional = ProvisionalPost {
            correlation_id,
            author_id: session.user_id.clone(),
            image_url: image_url.to_string(),
            caption: caption.to_string(),
            created_at: now,
        };
        self.state
            .send_modify(|s| s.entries.insert(0, FeedEntry::Pending(provisional)));

        match self.insert_post(&session, image_url, caption).await {
            Ok(post) => {
                self.state.send_modify(|s| commit_entry(s, correlation_id, &post));
                self.record(correlation_id, pending.commit(post.id, Utc::now())?);
                tracing::info!("Created post {} ({})", post.id, correlation_id);
                Ok(post)
            }
            Err(err) => {
                self.state.send_modify(|s| {
                    s.entries.retain(|e| e.correlation_id() != Some(correlation_id))
                });
                self.record(correlation_id, pending.roll_back(err.to_string(), Utc::now())?);
                tracing::warn!("Rolled back post create {}: {}", correlation_id, err);
                Err(err)
            }
        }
    }

    async fn insert_post(&self, session: &Session, image_url: &str, caption: &str) -> AppResult<Post> {
        let new_row = row([
            ("user_id", json!(session.user_id.as_str())),
            ("image_url", json!(image_url)),
            ("caption", json!(caption)),
        ]);

        let remote = self.gateway.remote();
        let rows = self
            .gateway
            .call("posts.insert", remote.insert(POSTS, vec![new_row]))
            .await
            .map_err(|cause| AppError::Create { cause })?;

        let inserted = rows.into_iter().next().ok_or_else(|| AppError::Create {
            cause: CallError::Remote(RemoteError::new("insert returned no rows", None)),
        })?;
        Post::from_row(inserted).map_err(|e| {
            tracing::warn!("Inserted post row is unreadable, the remote may still hold it: {}", e);
            AppError::Create {
                cause: CallError::Remote(RemoteError::new(
                    format!("unreadable post row: {}", e),
                    None,
                )),
            }
        })
    }

    /// Delete a post's hearts, then its comments, then the post.
    ///
    /// Not atomic: a failure stops at the failing stage and reports it,
    /// while earlier stages stay applied both remotely and locally.
    pub async fn delete(&self, post_id: PostId) -> AppResult<()> {
        self.session.require()?;
        let _guard = self.post_locks.lock(&post_id).await;

        let mut completed = Vec::with_capacity(DeleteStage::ORDER.len());
        for stage in DeleteStage::ORDER {
            let (table, operation, column) = match stage {
                DeleteStage::Hearts => (HEARTS, "hearts.delete", "post_id"),
                DeleteStage::Comments => (COMMENTS, "comments.delete", "post_id"),
                DeleteStage::Post => (POSTS, "posts.delete", "id"),
            };
            let filter = Filter::new().eq(column, post_id.value());

            let remote = self.gateway.remote();
            match self.gateway.call(operation, remote.delete(table, filter)).await {
                Ok(removed) => {
                    tracing::debug!("Deleted {} {} row(s) for post {}", removed, stage, post_id);
                    self.apply_delete_stage(post_id, stage);
                    completed.push(stage);
                }
                Err(cause) => {
                    tracing::warn!(
                        "Delete of post {} stopped at {} stage after {:?}: {}",
                        post_id,
                        stage,
                        completed,
                        cause
                    );
                    return Err(AppError::Delete {
                        stage,
                        completed,
                        cause,
                    });
                }
            }
        }

        tracing::info!("Deleted post {}", post_id);
        Ok(())
    }

    fn apply_delete_stage(&self, post_id: PostId, stage: DeleteStage) {
        self.state.send_modify(|s| {
            let Some(i) = s.position_of(post_id) else {
                return;
            };
            if stage == DeleteStage::Post {
                s.entries.remove(i);
                return;
            }
            if let FeedEntry::Committed(post) = &mut s.entries[i] {
                match stage {
                    DeleteStage::Hearts => post.heart_count = 0,
                    DeleteStage::Comments => post.comment_count = 0,
                    DeleteStage::Post => {}
                }
            }
        });
    }

    /// Shift a post's aggregate counts after a confirmed interaction.
    pub fn adjust_counts(&self, post_id: PostId, hearts: i64, comments: i64) {
        self.state.send_if_modified(|s| {
            let Some(i) = s.position_of(post_id) else {
                return false;
            };
            let FeedEntry::Committed(post) = &mut s.entries[i] else {
                return false;
            };
            post.heart_count = post.heart_count.saturating_add_signed(hearts);
            post.comment_count = post.comment_count.saturating_add_signed(comments);
            true
        });
    }

    /// Forget every post and mutation.
    pub fn reset(&self) {
        self.state.send_replace(FeedSnapshot::default());
        self.mutations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Holds `is_loading` up while a load is in flight. Clears it on drop, so a
/// load that is cancelled mid-await never leaves the flag stuck.
struct LoadingFlag<'a> {
    state: &'a watch::Sender<FeedSnapshot>,
}

impl<'a> LoadingFlag<'a> {
    fn raise(state: &'a watch::Sender<FeedSnapshot>) -> Self {
        set_loading(state, true);
        Self { state }
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        set_loading(self.state, false);
    }
}

fn set_loading(state: &watch::Sender<FeedSnapshot>, loading: bool) {
    state.send_if_modified(|s| {
        let changed = s.is_loading != loading;
        s.is_loading = loading;
        changed
    });
}

/// Swap the provisional entry for the authoritative post. If a refresh
/// already brought the post in, the provisional entry is simply dropped.
fn commit_entry(state: &mut FeedSnapshot, correlation_id: Uuid, post: &Post) {
    let provisional = state
        .entries
        .iter()
        .position(|e| e.correlation_id() == Some(correlation_id));
    let already_loaded = state.position_of(post.id).is_some();

    match (provisional, already_loaded) {
        (Some(i), false) => state.entries[i] = FeedEntry::Committed(post.clone()),
        (Some(i), true) => {
            state.entries.remove(i);
        }
        (None, false) => state.entries.insert(0, FeedEntry::Committed(post.clone())),
        (None, true) => {}
    }
}
