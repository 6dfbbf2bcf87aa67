// Boundary to the hosted backend: auth, tables and object storage.
//
// Stores never talk to a backend directly; they go through a `Gateway`
// wrapping some `RemoteClient`. Two clients ship with the crate:
// `HostedRemote` for a Supabase-style REST backend and `LocalRemote`,
// a SQLite stand-in used by the CLI's local mode and the tests.

mod gateway;
pub mod hosted;
pub mod local;
mod query;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::Metadata;

pub use self::gateway::Gateway;
pub use self::hosted::HostedRemote;
pub use self::local::{LocalBackend, LocalRemote};
pub use self::query::{row, Embed, Filter, Order, Row, Select};

/// Opaque failure reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub status_code: Option<u16>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Identity returned by the auth provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub cache_control_secs: u64,
    pub upsert: bool,
    pub content_type: String,
}

/// Remote backend contract - every call is a single request/response
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> RemoteResult<AuthUser>;

    /// Identity behind the currently held session, if it is still valid
    async fn get_session(&self) -> RemoteResult<Option<AuthUser>>;

    async fn get_user(&self) -> RemoteResult<AuthUser>;

    /// Merge `metadata` into the signed-in user's metadata
    async fn update_user(&self, metadata: Metadata) -> RemoteResult<AuthUser>;

    async fn sign_out(&self) -> RemoteResult<()>;

    async fn select(&self, query: Select) -> RemoteResult<Vec<Row>>;

    /// Insert rows and return them as stored
    async fn insert(&self, table: &str, rows: Vec<Row>) -> RemoteResult<Vec<Row>>;

    /// Delete matching rows, returning how many were removed
    async fn delete(&self, table: &str, filter: Filter) -> RemoteResult<u64>;

    async fn update(&self, table: &str, fields: Row, filter: Filter) -> RemoteResult<Vec<Row>>;

    /// Store an object and return its path inside the bucket
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> RemoteResult<String>;

    async fn public_url(&self, bucket: &str, path: &str) -> RemoteResult<String>;
}

pub type DynRemote = Arc<dyn RemoteClient>;
