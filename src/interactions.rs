// Hearts and comment threads for the signed-in user.
//
// Heart toggles are check-then-act against the remote. Within one context
// a second toggle for the same (post, user) while the first is in flight is
// rejected with `AppError::ConcurrentToggle`; it is never queued. Races
// between different clients are left to the remote's uniqueness constraint
// on `hearts(post_id, user_id)`.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

use crate::auth::SessionManager;
use crate::error::{AppError, AppResult, CallError, DeleteStage};
use crate::feed::{FeedStore, COMMENTS, HEARTS};
use crate::locks::KeyedLocks;
use crate::models::{Comment, HeartEdge, PostId, UserId};
use crate::remote::{row, Filter, Gateway, RemoteError, Select};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartState {
    Hearted,
    NotHearted,
}

impl HeartState {
    pub fn is_hearted(&self) -> bool {
        matches!(self, Self::Hearted)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InteractionSnapshot {
    /// Posts the signed-in user has hearted
    pub hearted: HashSet<PostId>,
    /// Loaded comment threads, newest first
    pub threads: HashMap<PostId, Vec<Comment>>,
}

pub struct InteractionTracker {
    gateway: Gateway,
    session: Arc<SessionManager>,
    feed: Arc<FeedStore>,
    post_locks: Arc<KeyedLocks<PostId>>,
    toggles: KeyedLocks<(PostId, UserId)>,
    state: watch::Sender<InteractionSnapshot>,
}

impl InteractionTracker {
    pub fn new(
        gateway: Gateway,
        session: Arc<SessionManager>,
        feed: Arc<FeedStore>,
        post_locks: Arc<KeyedLocks<PostId>>,
    ) -> Self {
        let (state, _) = watch::channel(InteractionSnapshot::default());
        Self {
            gateway,
            session,
            feed,
            post_locks,
            toggles: KeyedLocks::new(),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<InteractionSnapshot> {
        self.state.subscribe()
    }

    pub fn hearted(&self) -> HashSet<PostId> {
        self.state.borrow().hearted.clone()
    }

    /// Loaded thread for a post, or `None` if it was never loaded.
    pub fn comments(&self, post_id: PostId) -> Option<Vec<Comment>> {
        self.state.borrow().threads.get(&post_id).cloned()
    }

    pub async fn has_hearted(&self, post_id: PostId) -> AppResult<bool> {
        let session = self.session.require()?;
        self.heart_exists(post_id, &session.user_id).await
    }

    async fn heart_exists(&self, post_id: PostId, user_id: &UserId) -> AppResult<bool> {
        let query = Select::from(HEARTS)
            .eq("post_id", post_id.value())
            .eq("user_id", user_id.as_str())
            .limit(1);

        let remote = self.gateway.remote();
        let rows = self.gateway.call("hearts.select", remote.select(query)).await?;
        Ok(!rows.is_empty())
    }

    /// Every post `user_id` has hearted, in one round trip. Hydrates the
    /// local hearted set when `user_id` is the signed-in user.
    pub async fn load_hearted(&self, user_id: &UserId) -> AppResult<HashSet<PostId>> {
        let query = Select::from(HEARTS).eq("user_id", user_id.as_str());

        let remote = self.gateway.remote();
        let rows = self.gateway.call("hearts.select", remote.select(query)).await?;
        let hearted = rows
            .into_iter()
            .map(|r| {
                serde_json::from_value::<HeartEdge>(serde_json::Value::Object(r))
                    .map(|edge| edge.post_id)
            })
            .collect::<Result<HashSet<_>, _>>()?;

        let is_current = self
            .session
            .current_session()
            .is_some_and(|s| &s.user_id == user_id);
        if is_current {
            let local = hearted.clone();
            self.state.send_modify(|s| s.hearted = local);
        }

        Ok(hearted)
    }

    pub async fn toggle_heart(&self, post_id: PostId) -> AppResult<HeartState> {
        let session = self.session.require()?;
        let user_id = session.user_id;
        let _guard = self
            .toggles
            .try_lock(&(post_id, user_id.clone()))
            .ok_or(AppError::ConcurrentToggle { post_id })?;

        let next = if self.heart_exists(post_id, &user_id).await? {
            let filter = Filter::new()
                .eq("post_id", post_id.value())
                .eq("user_id", user_id.as_str());
            let remote = self.gateway.remote();
            let removed = self
                .gateway
                .call("hearts.delete", remote.delete(HEARTS, filter))
                .await?;

            self.feed.adjust_counts(post_id, -(removed as i64), 0);
            HeartState::NotHearted
        } else {
            let edge = row([
                ("post_id", json!(post_id.value())),
                ("user_id", json!(user_id.as_str())),
            ]);
            let remote = self.gateway.remote();
            self.gateway
                .call("hearts.insert", remote.insert(HEARTS, vec![edge]))
                .await?;

            self.feed.adjust_counts(post_id, 1, 0);
            HeartState::Hearted
        };

        self.state.send_modify(|s| {
            if next.is_hearted() {
                s.hearted.insert(post_id);
            } else {
                s.hearted.remove(&post_id);
            }
        });
        tracing::debug!("Post {} is now {:?} by {}", post_id, next, user_id);
        Ok(next)
    }

    /// Add a comment once the remote has stored it. The local thread (if
    /// loaded) gets the stored comment at its server-timestamp position.
    pub async fn add_comment(&self, post_id: PostId, content: &str) -> AppResult<Comment> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("comment must not be empty".to_string()));
        }
        if post_id.value() <= 0 {
            return Err(AppError::Validation(format!("invalid post id {}", post_id)));
        }
        let session = self.session.require()?;
        let _guard = self.post_locks.lock(&post_id).await;

        let new_row = row([
            ("post_id", json!(post_id.value())),
            ("user_id", json!(session.user_id.as_str())),
            ("content", json!(content)),
        ]);
        let remote = self.gateway.remote();
        let rows = self
            .gateway
            .call("comments.insert", remote.insert(COMMENTS, vec![new_row]))
            .await?;
        let stored = rows.into_iter().next().ok_or_else(|| {
            AppError::from(CallError::Remote(RemoteError::new(
                "insert returned no rows",
                None,
            )))
        })?;
        let comment = Comment::from_row(stored)?;

        let local = comment.clone();
        self.state.send_modify(|s| {
            if let Some(thread) = s.threads.get_mut(&post_id) {
                let at = thread
                    .iter()
                    .position(|c| c.created_at <= local.created_at)
                    .unwrap_or(thread.len());
                thread.insert(at, local);
            }
        });
        self.feed.adjust_counts(post_id, 0, 1);

        tracing::debug!("Comment {:?} added to post {}", comment.id, post_id);
        Ok(comment)
    }

    /// Fetch a post's comments newest first and replace the local thread.
    pub async fn load_comments(&self, post_id: PostId) -> AppResult<Vec<Comment>> {
        let query = Select::from(COMMENTS)
            .eq("post_id", post_id.value())
            .order_desc("created_at")
            .order_desc("id");

        let remote = self.gateway.remote();
        let rows = self
            .gateway
            .call("comments.select", remote.select(query))
            .await?;
        let thread = rows
            .into_iter()
            .map(Comment::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let local = thread.clone();
        self.state.send_modify(|s| {
            s.threads.insert(post_id, local);
        });
        Ok(thread)
    }

    /// Drop local state for a post that no longer exists.
    pub fn forget_post(&self, post_id: PostId) {
        self.mirror_delete(post_id, &DeleteStage::ORDER);
    }

    /// Mirror the stages of a post delete that the remote committed. A
    /// cleared comments stage empties a loaded thread; only the post stage
    /// drops the thread itself.
    pub fn mirror_delete(&self, post_id: PostId, completed: &[DeleteStage]) {
        self.state.send_if_modified(|s| {
            let mut changed = false;
            for stage in completed {
                match stage {
                    DeleteStage::Hearts => changed |= s.hearted.remove(&post_id),
                    DeleteStage::Comments => {
                        if let Some(thread) = s.threads.get_mut(&post_id) {
                            changed |= !thread.is_empty();
                            thread.clear();
                        }
                    }
                    DeleteStage::Post => {
                        changed |= s.hearted.remove(&post_id);
                        changed |= s.threads.remove(&post_id).is_some();
                    }
                }
            }
            changed
        });
    }

    pub fn reset(&self) {
        self.state.send_replace(InteractionSnapshot::default());
    }
}
