// Self-contained backend on SQLite plus a bucket directory.
//
// `LocalBackend` owns the database and storage root. Each `LocalRemote`
// handed out by `LocalBackend::client` holds its own auth session, so
// several clients can act against one backend the way separate devices
// act against the hosted one.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use rand::Rng;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, ErrorCode, OptionalExtension};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

use super::{AuthUser, Filter, RemoteClient, RemoteError, RemoteResult, Row, Select, UploadOptions};
use crate::db::{self, DbPool};
use crate::models::Metadata;

/// Tables reachable through the table API. `users` and `sessions` stay
/// behind the auth calls.
const PUBLIC_TABLES: &[&str] = &["posts", "hearts", "comments"];

const COUNT_SUFFIX: &str = "__count";

pub struct LocalBackend {
    pool: DbPool,
    storage_root: PathBuf,
    public_base: Url,
    session_hours: u64,
    hash_cost: u32,
}

impl LocalBackend {
    /// Open (or create) the database and bucket directory.
    pub fn open(db_path: &Path, storage_root: &Path) -> anyhow::Result<Self> {
        let pool = db::create_pool(db_path)?;
        db::run_migrations(&pool)?;
        std::fs::create_dir_all(storage_root)?;

        let storage_root = storage_root.canonicalize()?;
        let public_base = Url::from_directory_path(&storage_root).map_err(|_| {
            anyhow::anyhow!("storage root is not absolute: {}", storage_root.display())
        })?;

        Ok(Self {
            pool,
            storage_root,
            public_base,
            session_hours: 720,
            hash_cost: bcrypt::DEFAULT_COST,
        })
    }

    /// Serve public URLs under `base` instead of `file://` paths.
    pub fn with_public_base_url(mut self, base: &str) -> anyhow::Result<Self> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        self.public_base = base;
        Ok(self)
    }

    pub fn with_session_hours(mut self, hours: u64) -> Self {
        self.session_hours = hours;
        self
    }

    /// bcrypt cost for new accounts. Tests use the minimum cost of 4.
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// A new client with its own (empty) auth session.
    pub fn client(self: &Arc<Self>) -> LocalRemote {
        LocalRemote {
            backend: Arc::clone(self),
            session: Mutex::new(None),
        }
    }

    /// Register an account. Returns the new user id.
    pub fn create_user(
        &self,
        email: &str,
        password: &str,
        metadata: Metadata,
    ) -> RemoteResult<String> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(RemoteError::new("Email and password are required", Some(400)));
        }

        let hash = bcrypt::hash(password, self.hash_cost)
            .map_err(|e| RemoteError::new(format!("Password hashing failed: {}", e), Some(500)))?;
        let id = uuid::Uuid::new_v4().to_string();
        let metadata_json = serde_json::to_string(&metadata).map_err(internal)?;

        let conn = self.pool.get().map_err(internal)?;
        conn.execute(
            "INSERT INTO users (id, email, password_hash, user_metadata) VALUES (?1, ?2, ?3, ?4)",
            params![id, email.trim().to_lowercase(), hash, metadata_json],
        )
        .map_err(|e| match sql_error(e) {
            err if err.status_code == Some(409) => {
                RemoteError::new("User already registered", Some(422))
            }
            err => err,
        })?;

        tracing::info!("Registered local user {}", id);
        Ok(id)
    }

    fn load_user(&self, user_id: &str) -> RemoteResult<AuthUser> {
        let conn = self.pool.get().map_err(internal)?;
        let found: Option<(String, String)> = conn
            .query_row(
                "SELECT email, user_metadata FROM users WHERE id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_error)?;

        let (email, metadata_json) =
            found.ok_or_else(|| RemoteError::new("User not found", Some(404)))?;
        Ok(AuthUser {
            id: user_id.to_string(),
            email: Some(email),
            user_metadata: serde_json::from_str(&metadata_json).map_err(internal)?,
        })
    }

    fn bucket_path(&self, bucket: &str, path: &str) -> RemoteResult<PathBuf> {
        identifier(bucket)?;
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(RemoteError::new(format!("Invalid object path: {}", path), Some(400)));
        }
        Ok(self.storage_root.join(bucket).join(relative))
    }
}

#[derive(Debug, Clone)]
struct LocalSession {
    token: String,
    user_id: String,
}

/// One client's view of a [`LocalBackend`].
pub struct LocalRemote {
    backend: Arc<LocalBackend>,
    session: Mutex<Option<LocalSession>>,
}

impl LocalRemote {
    fn current(&self) -> Option<LocalSession> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, session: Option<LocalSession>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// User id behind a still-valid session token.
    fn active_user(&self) -> RemoteResult<Option<String>> {
        let Some(session) = self.current() else {
            return Ok(None);
        };

        let conn = self.backend.pool.get().map_err(internal)?;
        let user_id: Option<String> = conn
            .query_row(
                "SELECT user_id FROM sessions WHERE token = ?1 AND expires_at > ?2",
                params![session.token, Utc::now().timestamp()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)?;

        if user_id.is_none() {
            self.set_current(None);
        }
        Ok(user_id)
    }

    fn require_user(&self) -> RemoteResult<String> {
        self.active_user()?
            .ok_or_else(|| RemoteError::new("Auth session missing!", Some(401)))
    }
}

#[async_trait]
impl RemoteClient for LocalRemote {
    async fn sign_in(&self, email: &str, password: &str) -> RemoteResult<AuthUser> {
        let found: Option<(String, String)> = {
            let conn = self.backend.pool.get().map_err(internal)?;
            conn.query_row(
                "SELECT id, password_hash FROM users WHERE email = ?1",
                params![email.trim().to_lowercase()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_error)?
        };

        let user_id = match found {
            Some((id, hash)) if bcrypt::verify(password, &hash).unwrap_or(false) => id,
            _ => {
                self.set_current(None);
                return Err(RemoteError::new("Invalid login credentials", Some(400)));
            }
        };

        let token = generate_token();
        let expires_at = Utc::now() + Duration::hours(self.backend.session_hours as i64);
        {
            let conn = self.backend.pool.get().map_err(internal)?;
            conn.execute(
                "INSERT INTO sessions (id, user_id, token, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    uuid::Uuid::now_v7().to_string(),
                    user_id,
                    token,
                    expires_at.timestamp()
                ],
            )
            .map_err(sql_error)?;
        }

        self.set_current(Some(LocalSession {
            token,
            user_id: user_id.clone(),
        }));
        self.backend.load_user(&user_id)
    }

    async fn get_session(&self) -> RemoteResult<Option<AuthUser>> {
        match self.active_user()? {
            Some(user_id) => self.backend.load_user(&user_id).map(Some),
            None => Ok(None),
        }
    }

    async fn get_user(&self) -> RemoteResult<AuthUser> {
        let user_id = self.require_user()?;
        self.backend.load_user(&user_id)
    }

    async fn update_user(&self, metadata: Metadata) -> RemoteResult<AuthUser> {
        let user_id = self.require_user()?;
        let mut current = self.backend.load_user(&user_id)?.user_metadata;
        current.extend(metadata);

        let conn = self.backend.pool.get().map_err(internal)?;
        conn.execute(
            "UPDATE users SET user_metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&current).map_err(internal)?, user_id],
        )
        .map_err(sql_error)?;
        drop(conn);

        self.backend.load_user(&user_id)
    }

    async fn sign_out(&self) -> RemoteResult<()> {
        if let Some(session) = self.current() {
            let conn = self.backend.pool.get().map_err(internal)?;
            conn.execute("DELETE FROM sessions WHERE token = ?1", params![session.token])
                .map_err(sql_error)?;
            tracing::debug!("Signed out local user {}", session.user_id);
        }
        self.set_current(None);
        Ok(())
    }

    async fn select(&self, query: Select) -> RemoteResult<Vec<Row>> {
        let table = public_table(&query.table)?;

        let mut sql = String::from("SELECT t.*");
        for embed in &query.counts {
            let related = public_table(&embed.table)?;
            let fk = identifier(&embed.foreign_key)?;
            sql.push_str(&format!(
                ", (SELECT COUNT(*) FROM {related} c WHERE c.{fk} = t.id) AS {related}{COUNT_SUFFIX}"
            ));
        }
        sql.push_str(&format!(" FROM {table} t"));

        let (clause, values) = where_clause(&query.filter, "t.")?;
        sql.push_str(&clause);

        if !query.order.is_empty() {
            let terms = query
                .order
                .iter()
                .map(|o| {
                    identifier(&o.column)
                        .map(|c| format!("t.{} {}", c, if o.descending { "DESC" } else { "ASC" }))
                })
                .collect::<RemoteResult<Vec<_>>>()?;
            sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.backend.pool.get().map_err(internal)?;
        let mut stmt = conn.prepare(&sql).map_err(sql_error)?;
        let rows = read_rows(&mut stmt, values)?;

        Ok(rows.into_iter().map(fold_counts).collect())
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> RemoteResult<Vec<Row>> {
        let table = public_table(table)?;
        let user_id = self.require_user()?;

        let mut conn = self.backend.pool.get().map_err(internal)?;
        let tx = conn.transaction().map_err(sql_error)?;
        let mut inserted = Vec::with_capacity(rows.len());

        for row in rows {
            if let Some(owner) = row.get("user_id").and_then(Value::as_str) {
                if owner != user_id {
                    return Err(RemoteError::new(
                        format!("new row violates row-level security policy for table \"{}\"", table),
                        Some(403),
                    ));
                }
            }
            if row.is_empty() {
                return Err(RemoteError::new("Cannot insert an empty row", Some(400)));
            }

            let columns = row
                .keys()
                .map(|c| identifier(c))
                .collect::<RemoteResult<Vec<_>>>()?;
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                table,
                columns.join(", "),
                placeholders.join(", ")
            );
            let values: Vec<SqlValue> = row.values().map(to_sql).collect();

            let mut stmt = tx.prepare(&sql).map_err(sql_error)?;
            inserted.extend(read_rows(&mut stmt, values)?);
        }

        tx.commit().map_err(sql_error)?;
        Ok(inserted)
    }

    async fn delete(&self, table: &str, filter: Filter) -> RemoteResult<u64> {
        let table = public_table(table)?;
        self.require_user()?;
        if filter.is_empty() {
            return Err(RemoteError::new("DELETE requires a filter", Some(400)));
        }

        let (clause, values) = where_clause(&filter, "")?;
        let conn = self.backend.pool.get().map_err(internal)?;
        let removed = conn
            .execute(&format!("DELETE FROM {table}{clause}"), params_from_iter(values))
            .map_err(sql_error)?;
        Ok(removed as u64)
    }

    async fn update(&self, table: &str, fields: Row, filter: Filter) -> RemoteResult<Vec<Row>> {
        let table = public_table(table)?;
        self.require_user()?;
        if filter.is_empty() || fields.is_empty() {
            return Err(RemoteError::new("UPDATE requires fields and a filter", Some(400)));
        }

        let mut assignments = Vec::with_capacity(fields.len());
        let mut values = Vec::with_capacity(fields.len() + filter.conditions().len());
        for (column, value) in &fields {
            assignments.push(format!("{} = ?{}", identifier(column)?, values.len() + 1));
            values.push(to_sql(value));
        }

        let mut sql = format!("UPDATE {} SET {}", table, assignments.join(", "));
        let mut conditions = Vec::new();
        for (column, value) in filter.conditions() {
            conditions.push(format!("{} = ?{}", identifier(column)?, values.len() + 1));
            values.push(to_sql(value));
        }
        sql.push_str(&format!(" WHERE {} RETURNING *", conditions.join(" AND ")));

        let conn = self.backend.pool.get().map_err(internal)?;
        let mut stmt = conn.prepare(&sql).map_err(sql_error)?;
        read_rows(&mut stmt, values)
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> RemoteResult<String> {
        self.require_user()?;
        let target = self.backend.bucket_path(bucket, path)?;

        if !options.upsert && tokio::fs::try_exists(&target).await.map_err(internal)? {
            return Err(RemoteError::new("The resource already exists", Some(409)));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(internal)?;
        }
        tokio::fs::write(&target, &data).await.map_err(internal)?;

        tracing::debug!(
            "Stored {} bytes at {}/{} ({})",
            data.len(),
            bucket,
            path,
            options.content_type
        );
        Ok(path.to_string())
    }

    async fn public_url(&self, bucket: &str, path: &str) -> RemoteResult<String> {
        self.backend.bucket_path(bucket, path)?;
        self.backend
            .public_base
            .join(&format!("{}/{}", bucket, path))
            .map(String::from)
            .map_err(|e| RemoteError::new(format!("Invalid object URL: {}", e), Some(400)))
    }
}

/// Generate a cryptographically random 32-byte hex token.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn identifier(name: &str) -> RemoteResult<&str> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(RemoteError::new(format!("Invalid identifier: {}", name), Some(400)))
    }
}

fn public_table(name: &str) -> RemoteResult<&str> {
    if PUBLIC_TABLES.contains(&name) {
        Ok(name)
    } else {
        Err(RemoteError::new(
            format!("relation \"public.{}\" does not exist", name),
            Some(404),
        ))
    }
}

fn where_clause(filter: &Filter, prefix: &str) -> RemoteResult<(String, Vec<SqlValue>)> {
    if filter.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut terms = Vec::with_capacity(filter.conditions().len());
    let mut values = Vec::with_capacity(filter.conditions().len());
    for (i, (column, value)) in filter.conditions().iter().enumerate() {
        terms.push(format!("{}{} = ?{}", prefix, identifier(column)?, i + 1));
        values.push(to_sql(value));
    }
    Ok((format!(" WHERE {}", terms.join(" AND ")), values))
}

fn read_rows(stmt: &mut rusqlite::Statement<'_>, values: Vec<SqlValue>) -> RemoteResult<Vec<Row>> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt
        .query_map(params_from_iter(values), |r| {
            let mut out = Row::new();
            for (i, name) in names.iter().enumerate() {
                out.insert(name.clone(), from_sql(r.get_ref(i)?));
            }
            Ok(out)
        })
        .map_err(sql_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_error)?;
    Ok(rows)
}

/// Rewrites `hearts__count: 3` into the embedded `hearts: [{"count": 3}]`.
fn fold_counts(row: Row) -> Row {
    row.into_iter()
        .map(|(column, value)| match column.strip_suffix(COUNT_SUFFIX) {
            Some(relation) => (relation.to_string(), json!([{ "count": value }])),
            None => (column, value),
        })
        .collect()
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn sql_error(err: rusqlite::Error) -> RemoteError {
    let status = match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => 409,
        rusqlite::Error::QueryReturnedNoRows => 404,
        _ => 500,
    };
    RemoteError::new(err.to_string(), Some(status))
}

fn internal(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::new(err.to_string(), Some(500))
}
