// Domain types shared by the stores
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::remote::{AuthUser, Row};

/// Free-form user metadata as stored by the auth provider.
pub type Metadata = serde_json::Map<String, Value>;

/// New types for compile-time safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub i64);

impl PostId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub i64);

/// Role derived from the user metadata claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Role {
    SuperAdministrator,
    Declared(String),
    Unassigned,
}

impl Role {
    /// `is_admin` wins over whatever `user_role` says.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        if metadata.get("is_admin").and_then(Value::as_bool) == Some(true) {
            return Self::SuperAdministrator;
        }

        match metadata.get("user_role").and_then(Value::as_str) {
            Some(role) if !role.trim().is_empty() => Self::Declared(role.trim().to_string()),
            _ => Self::Unassigned,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::SuperAdministrator => "Super Administrator",
            Self::Declared(name) => name,
            Self::Unassigned => "",
        }
    }
}

/// The signed-in user as mirrored on the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub user_id: UserId,
    pub email: String,
    pub role: Role,
    pub metadata: Metadata,
}

impl Session {
    pub fn from_identity(user: AuthUser) -> Self {
        let role = Role::from_metadata(&user.user_metadata);
        Self {
            user_id: UserId::new(user.id),
            email: user.email.unwrap_or_default(),
            role,
            metadata: user.user_metadata,
        }
    }

    /// Driver accounts are flagged in metadata or carry the `driver` role.
    pub fn is_driver(&self) -> bool {
        if self.metadata.get("is_driver").and_then(Value::as_bool) == Some(true) {
            return true;
        }
        matches!(&self.role, Role::Declared(name) if name.eq_ignore_ascii_case("driver"))
    }

    pub fn image_url(&self) -> Option<&str> {
        self.metadata.get("image_url").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: UserId,
    pub image_url: String,
    pub caption: String,
    pub created_at: DateTime<Utc>,
    pub heart_count: u64,
    pub comment_count: u64,
}

/// Wire shape of a `posts` row, optionally with embedded aggregates.
#[derive(Debug, Deserialize)]
struct PostRow {
    id: PostId,
    user_id: UserId,
    image_url: String,
    #[serde(default)]
    caption: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    hearts: Option<Value>,
    #[serde(default)]
    comments: Option<Value>,
}

impl Post {
    pub fn from_row(row: Row) -> Result<Self, serde_json::Error> {
        let raw: PostRow = serde_json::from_value(Value::Object(row))?;
        Ok(Self {
            id: raw.id,
            author_id: raw.user_id,
            image_url: raw.image_url,
            caption: raw.caption.unwrap_or_default(),
            created_at: raw.created_at,
            heart_count: aggregate_count(raw.hearts.as_ref()),
            comment_count: aggregate_count(raw.comments.as_ref()),
        })
    }
}

/// Reads an embedded `rel(count)` aggregate. Anything missing or malformed
/// counts as zero.
pub fn aggregate_count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Array(items)) => items.first().map(|v| aggregate_count(Some(v))).unwrap_or(0),
        Some(Value::Object(map)) => map.get("count").and_then(Value::as_u64).unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeartEdge {
    pub post_id: PostId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    #[serde(rename = "user_id")]
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn from_row(row: Row) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(row))
    }
}
