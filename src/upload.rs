// Local file to stored object to public URL.

use bytes::Bytes;
use chrono::Utc;
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;

use crate::auth::SessionManager;
use crate::error::{AppError, AppResult, UploadStage};
use crate::models::UserId;
use crate::remote::{Gateway, UploadOptions};

const FALLBACK_EXTENSION: &str = "bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Unique key per upload, never overwrites
    NewPost,
    /// One key per user, replaced on every upload
    ProfileImage,
}

impl UploadMode {
    pub fn overwrites(&self) -> bool {
        matches!(self, Self::ProfileImage)
    }
}

/// Bytes plus the name they were picked under.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub async fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, data))
    }

    pub fn extension(&self) -> String {
        extension_of(&self.name)
    }

    pub fn content_type(&self) -> String {
        mime_guess::from_ext(&self.extension())
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

/// Lowercased text after the last dot, or `bin`.
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => FALLBACK_EXTENSION.to_string(),
    }
}

/// Inputs to object naming that vary per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingContext<'a> {
    pub user_id: &'a UserId,
    pub extension: &'a str,
    pub epoch_millis: i64,
    pub nonce: &'a str,
}

/// Storage key for an upload. Pure, so naming is testable without a clock.
pub fn object_key(mode: UploadMode, ctx: &NamingContext<'_>) -> String {
    match mode {
        UploadMode::NewPost => format!(
            "posts/{}_{}_{}.{}",
            ctx.user_id, ctx.epoch_millis, ctx.nonce, ctx.extension
        ),
        UploadMode::ProfileImage => format!("avatars/{}-avatar.{}", ctx.user_id, ctx.extension),
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct UploadPipeline {
    gateway: Gateway,
    session: Arc<SessionManager>,
    bucket: String,
    cache_control_secs: u64,
}

impl UploadPipeline {
    pub fn new(
        gateway: Gateway,
        session: Arc<SessionManager>,
        bucket: impl Into<String>,
        cache_control_secs: u64,
    ) -> Self {
        Self {
            gateway,
            session,
            bucket: bucket.into(),
            cache_control_secs,
        }
    }

    /// Store `file` and return its public URL.
    pub async fn upload(&self, file: UploadFile, mode: UploadMode) -> AppResult<String> {
        let session = self.session.require()?;
        let extension = file.extension();
        let nonce = generate_nonce();
        let key = object_key(
            mode,
            &NamingContext {
                user_id: &session.user_id,
                extension: &extension,
                epoch_millis: Utc::now().timestamp_millis(),
                nonce: &nonce,
            },
        );

        let options = UploadOptions {
            cache_control_secs: self.cache_control_secs,
            upsert: mode.overwrites(),
            content_type: file.content_type(),
        };
        let size = file.data.len();

        let remote = self.gateway.remote();
        let path = self
            .gateway
            .call(
                "storage.upload",
                remote.upload(&self.bucket, &key, file.data, options),
            )
            .await
            .map_err(|cause| AppError::Upload {
                stage: UploadStage::Upload,
                cause,
            })?;

        let url = self
            .gateway
            .call("storage.public_url", remote.public_url(&self.bucket, &path))
            .await
            .map_err(|cause| AppError::Upload {
                stage: UploadStage::UrlResolution,
                cause,
            })?;

        tracing::info!("Uploaded {} ({} bytes) to {}/{}", file.name, size, self.bucket, path);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_rules() {
        assert_eq!(extension_of("Photo.JPG"), "jpg");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of("README"), "bin");
        assert_eq!(extension_of("trailing."), "bin");
        assert_eq!(extension_of(""), "bin");
    }

    #[test]
    fn test_post_keys_are_unique_per_upload() {
        let user = UserId::new("u1");
        let ctx = NamingContext {
            user_id: &user,
            extension: "png",
            epoch_millis: 1_700_000_000_000,
            nonce: "0a1b2c3d",
        };
        assert_eq!(
            object_key(UploadMode::NewPost, &ctx),
            "posts/u1_1700000000000_0a1b2c3d.png"
        );

        let other = NamingContext { nonce: "ffffffff", ..ctx.clone() };
        assert_ne!(object_key(UploadMode::NewPost, &ctx), object_key(UploadMode::NewPost, &other));
    }

    #[test]
    fn test_avatar_key_is_stable() {
        let user = UserId::new("u1");
        let first = NamingContext {
            user_id: &user,
            extension: "jpg",
            epoch_millis: 1,
            nonce: "aa",
        };
        let second = NamingContext { epoch_millis: 2, nonce: "bb", ..first.clone() };
        assert_eq!(object_key(UploadMode::ProfileImage, &first), "avatars/u1-avatar.jpg");
        assert_eq!(
            object_key(UploadMode::ProfileImage, &first),
            object_key(UploadMode::ProfileImage, &second)
        );
    }

    #[test]
    fn test_content_type_from_extension() {
        assert_eq!(UploadFile::new("a.PNG", vec![1u8]).content_type(), "image/png");
        assert_eq!(UploadFile::new("a.jpeg", vec![1u8]).content_type(), "image/jpeg");
        assert_eq!(
            UploadFile::new("blob", vec![1u8]).content_type(),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_nonce_is_hex() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 8);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_overwrite_only_for_profile_images() {
        assert!(UploadMode::ProfileImage.overwrites());
        assert!(!UploadMode::NewPost.overwrites());
    }
}
