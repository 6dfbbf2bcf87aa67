// REST client for a Supabase-style hosted backend.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{PoisonError, RwLock};
use url::Url;

use super::{AuthUser, Filter, RemoteClient, RemoteError, RemoteResult, Row, Select, UploadOptions};
use crate::models::Metadata;

#[derive(Debug, Clone)]
struct HostedSession {
    access_token: String,
    expires_at: DateTime<Utc>,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    user: AuthUser,
}

pub struct HostedRemote {
    http: reqwest::Client,
    base: Url,
    anon_key: String,
    session: RwLock<Option<HostedSession>>,
}

impl HostedRemote {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base,
            anon_key: anon_key.into(),
            session: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> RemoteResult<Url> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::new(format!("Invalid endpoint {}: {}", path, e), None))
    }

    fn current(&self) -> Option<HostedSession> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, session: Option<HostedSession>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// Request carrying the project key and the user's bearer token when
    /// signed in (the anon key otherwise).
    fn request(&self, method: Method, path: &str) -> RemoteResult<RequestBuilder> {
        let bearer = self
            .current()
            .map(|s| s.access_token)
            .unwrap_or_else(|| self.anon_key.clone());
        Ok(self
            .http
            .request(method, self.endpoint(path)?)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer))
    }

    fn table_request(&self, method: Method, table: &str, filter: &Filter) -> RemoteResult<RequestBuilder> {
        let pairs = filter_pairs(filter);
        Ok(self
            .request(method, &format!("rest/v1/{}", table))?
            .query(&pairs)
            .header("Prefer", "return=representation"))
    }
}

async fn send(request: RequestBuilder) -> RemoteResult<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| RemoteError::new(e.to_string(), e.status().map(|s| s.as_u16())))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::new(
        error_message(&body).unwrap_or_else(|| status.to_string()),
        Some(status.as_u16()),
    ))
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> RemoteResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| RemoteError::new(format!("Unexpected response body: {}", e), None))
}

/// Pull a human readable message out of an error body. Auth, REST and
/// storage endpoints each use a different key.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "msg", "error_description", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(String::from)
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn filter_pairs(filter: &Filter) -> Vec<(String, String)> {
    filter
        .conditions()
        .iter()
        .map(|(column, value)| (column.clone(), format!("eq.{}", literal(value))))
        .collect()
}

fn select_pairs(query: &Select) -> Vec<(String, String)> {
    let mut columns = String::from("*");
    for embed in &query.counts {
        columns.push_str(&format!(",{}(count)", embed.table));
    }

    let mut pairs = vec![("select".to_string(), columns)];
    pairs.extend(filter_pairs(&query.filter));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.descending { "desc" } else { "asc" }))
            .collect::<Vec<_>>()
            .join(",");
        pairs.push(("order".to_string(), order));
    }
    if let Some(limit) = query.limit {
        pairs.push(("limit".to_string(), limit.to_string()));
    }
    pairs
}

#[async_trait]
impl RemoteClient for HostedRemote {
    async fn sign_in(&self, email: &str, password: &str) -> RemoteResult<AuthUser> {
        let request = self
            .request(Method::POST, "auth/v1/token")?
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));

        let token: TokenResponse = match send(request).await {
            Ok(response) => read_json(response).await?,
            Err(e) => {
                self.set_current(None);
                return Err(e);
            }
        };

        let user = token.user.clone();
        self.set_current(Some(HostedSession {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
            user: token.user,
        }));
        Ok(user)
    }

    async fn get_session(&self) -> RemoteResult<Option<AuthUser>> {
        match self.current() {
            Some(session) if session.expires_at > Utc::now() => Ok(Some(session.user)),
            Some(_) => {
                self.set_current(None);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn get_user(&self) -> RemoteResult<AuthUser> {
        if self.current().is_none() {
            return Err(RemoteError::new("Auth session missing!", Some(401)));
        }
        let response = send(self.request(Method::GET, "auth/v1/user")?).await?;
        read_json(response).await
    }

    async fn update_user(&self, metadata: Metadata) -> RemoteResult<AuthUser> {
        let Some(session) = self.current() else {
            return Err(RemoteError::new("Auth session missing!", Some(401)));
        };
        let request = self
            .request(Method::PUT, "auth/v1/user")?
            .json(&json!({ "data": metadata }));
        let user: AuthUser = read_json(send(request).await?).await?;

        self.set_current(Some(HostedSession {
            user: user.clone(),
            ..session
        }));
        Ok(user)
    }

    async fn sign_out(&self) -> RemoteResult<()> {
        if self.current().is_some() {
            send(self.request(Method::POST, "auth/v1/logout")?).await?;
        }
        self.set_current(None);
        Ok(())
    }

    async fn select(&self, query: Select) -> RemoteResult<Vec<Row>> {
        let request = self
            .request(Method::GET, &format!("rest/v1/{}", query.table))?
            .query(&select_pairs(&query));
        read_json(send(request).await?).await
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> RemoteResult<Vec<Row>> {
        let request = self
            .request(Method::POST, &format!("rest/v1/{}", table))?
            .header("Prefer", "return=representation")
            .json(&rows);
        read_json(send(request).await?).await
    }

    async fn delete(&self, table: &str, filter: Filter) -> RemoteResult<u64> {
        let request = self.table_request(Method::DELETE, table, &filter)?;
        let removed: Vec<Row> = read_json(send(request).await?).await?;
        Ok(removed.len() as u64)
    }

    async fn update(&self, table: &str, fields: Row, filter: Filter) -> RemoteResult<Vec<Row>> {
        let request = self
            .table_request(Method::PATCH, table, &filter)?
            .json(&fields);
        read_json(send(request).await?).await
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> RemoteResult<String> {
        let request = self
            .request(Method::POST, &format!("storage/v1/object/{}/{}", bucket, path))?
            .header("cache-control", format!("max-age={}", options.cache_control_secs))
            .header("x-upsert", options.upsert.to_string())
            .header("content-type", options.content_type)
            .body(data);
        send(request).await?;
        Ok(path.to_string())
    }

    async fn public_url(&self, bucket: &str, path: &str) -> RemoteResult<String> {
        self.endpoint(&format!("storage/v1/object/public/{}/{}", bucket, path))
            .map(String::from)
    }
}
