#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tempfile::TempDir;

use petagram::models::{Metadata, Post};
use petagram::remote::{
    AuthUser, DynRemote, Filter, LocalBackend, RemoteClient, RemoteError, RemoteResult, Row,
    Select, UploadOptions,
};
use petagram::{AppContext, ClientSettings};

pub const PASSWORD: &str = "correct horse";

/// A local backend in a scratch directory.
pub struct Fixture {
    pub dir: TempDir,
    pub backend: Arc<LocalBackend>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let backend = LocalBackend::open(&dir.path().join("test.db"), &dir.path().join("storage"))
            .expect("Failed to open local backend")
            .with_hash_cost(4);
        Self {
            dir,
            backend: Arc::new(backend),
        }
    }

    pub fn user(&self, email: &str, metadata: Value) -> String {
        let metadata: Metadata = metadata.as_object().cloned().unwrap_or_default();
        self.backend
            .create_user(email, PASSWORD, metadata)
            .expect("Failed to create user")
    }

    pub fn remote(&self) -> DynRemote {
        Arc::new(self.backend.client())
    }

    pub fn context(&self) -> AppContext {
        context_with(self.remote(), Duration::from_secs(5))
    }

    pub async fn signed_in(&self, email: &str) -> AppContext {
        let ctx = self.context();
        ctx.session
            .authenticate(email, PASSWORD)
            .await
            .expect("Failed to sign in");
        ctx
    }

    pub fn count(&self, sql: &str) -> i64 {
        let conn = self.backend.pool().get().expect("Failed to get connection");
        conn.query_row(sql, [], |row| row.get(0))
            .expect("Failed to count rows")
    }
}

pub fn context_with(remote: DynRemote, timeout: Duration) -> AppContext {
    AppContext::new(
        remote,
        ClientSettings {
            request_timeout: timeout,
            ..ClientSettings::default()
        },
    )
}

pub async fn seed_post(ctx: &AppContext, caption: &str) -> Post {
    ctx.feed
        .create(&format!("https://cdn.example/{}.png", caption), caption)
        .await
        .expect("Failed to create post")
}

/// Wraps a remote and injects failures, delays, hangs or unreadable rows
/// per operation. Operations are named `"<verb>:<table>"`, e.g.
/// `"delete:comments"`, `"select:hearts"` or `"upload:petagram"`.
pub struct FaultyRemote {
    inner: DynRemote,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    corrupting: Mutex<HashSet<String>>,
    delay: Mutex<Option<(String, Duration)>>,
}

impl FaultyRemote {
    pub fn new(inner: DynRemote) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            corrupting: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
        })
    }

    pub fn fail(&self, operation: &str) {
        self.failing.lock().unwrap().insert(operation.to_string());
    }

    pub fn hang(&self, operation: &str) {
        self.hanging.lock().unwrap().insert(operation.to_string());
    }

    /// Let the operation succeed but strip `created_at` from the rows it returns.
    pub fn corrupt(&self, operation: &str) {
        self.corrupting.lock().unwrap().insert(operation.to_string());
    }

    pub fn delay(&self, operation: &str, by: Duration) {
        *self.delay.lock().unwrap() = Some((operation.to_string(), by));
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.hanging.lock().unwrap().clear();
        self.corrupting.lock().unwrap().clear();
        *self.delay.lock().unwrap() = None;
    }

    async fn intercept(&self, operation: String) -> RemoteResult<()> {
        let delay = self
            .delay
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(name, _)| *name == operation)
            .map(|(_, by)| *by);
        if let Some(by) = delay {
            tokio::time::sleep(by).await;
        }

        let hangs = self.hanging.lock().unwrap().contains(&operation);
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let fails = self.failing.lock().unwrap().contains(&operation);
        if fails {
            return Err(RemoteError::new(
                format!("injected failure on {}", operation),
                Some(500),
            ));
        }
        Ok(())
    }

    fn mangle(&self, operation: &str, mut rows: Vec<Row>) -> Vec<Row> {
        if self.corrupting.lock().unwrap().contains(operation) {
            for row in &mut rows {
                row.remove("created_at");
            }
        }
        rows
    }
}

#[async_trait]
impl RemoteClient for FaultyRemote {
    async fn sign_in(&self, email: &str, password: &str) -> RemoteResult<AuthUser> {
        self.intercept("sign_in:auth".into()).await?;
        self.inner.sign_in(email, password).await
    }

    async fn get_session(&self) -> RemoteResult<Option<AuthUser>> {
        self.intercept("get_session:auth".into()).await?;
        self.inner.get_session().await
    }

    async fn get_user(&self) -> RemoteResult<AuthUser> {
        self.intercept("get_user:auth".into()).await?;
        self.inner.get_user().await
    }

    async fn update_user(&self, metadata: Metadata) -> RemoteResult<AuthUser> {
        self.intercept("update_user:auth".into()).await?;
        self.inner.update_user(metadata).await
    }

    async fn sign_out(&self) -> RemoteResult<()> {
        self.intercept("sign_out:auth".into()).await?;
        self.inner.sign_out().await
    }

    async fn select(&self, query: Select) -> RemoteResult<Vec<Row>> {
        let operation = format!("select:{}", query.table);
        self.intercept(operation.clone()).await?;
        let rows = self.inner.select(query).await?;
        Ok(self.mangle(&operation, rows))
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> RemoteResult<Vec<Row>> {
        let operation = format!("insert:{}", table);
        self.intercept(operation.clone()).await?;
        let rows = self.inner.insert(table, rows).await?;
        Ok(self.mangle(&operation, rows))
    }

    async fn delete(&self, table: &str, filter: Filter) -> RemoteResult<u64> {
        self.intercept(format!("delete:{}", table)).await?;
        self.inner.delete(table, filter).await
    }

    async fn update(&self, table: &str, fields: Row, filter: Filter) -> RemoteResult<Vec<Row>> {
        self.intercept(format!("update:{}", table)).await?;
        self.inner.update(table, fields, filter).await
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> RemoteResult<String> {
        self.intercept(format!("upload:{}", bucket)).await?;
        self.inner.upload(bucket, path, data, options).await
    }

    async fn public_url(&self, bucket: &str, path: &str) -> RemoteResult<String> {
        self.intercept(format!("public_url:{}", bucket)).await?;
        self.inner.public_url(bucket, path).await
    }
}

pub fn metadata(value: Value) -> Metadata {
    value.as_object().cloned().unwrap_or_default()
}

pub fn driver() -> Value {
    json!({"is_driver": true})
}
