use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::context::ClientSettings;

#[derive(Parser, Debug)]
#[command(name = "petagram", about = "Photo feed client")]
pub struct Cli {
    #[command(flatten)]
    pub args: ConfigArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Backend to talk to
    #[arg(long, value_enum, global = true)]
    pub backend: Option<Backend>,

    /// Base URL of the hosted backend
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Anonymous API key of the hosted backend
    #[arg(long, env = "PETAGRAM_ANON_KEY", global = true, hide_env_values = true)]
    pub anon_key: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[arg(long, env = "PETAGRAM_EMAIL", global = true)]
    pub email: Option<String>,

    #[arg(long, env = "PETAGRAM_PASSWORD", global = true, hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Register an account (local backend only)
    Signup {
        #[arg(value_name = "EMAIL")]
        new_email: String,
        #[arg(value_name = "PASSWORD")]
        new_password: String,
        /// Mark the account as a driver
        #[arg(long)]
        driver: bool,
    },
    /// Sign in and show the session
    Whoami,
    /// List the feed, newest first
    Feed,
    /// Upload an image and post it
    Post {
        image: PathBuf,
        #[arg(long, default_value = "")]
        caption: String,
    },
    /// Toggle your heart on a post
    Heart { post_id: i64 },
    /// Comment on a post
    Comment { post_id: i64, content: String },
    /// Show a post's comments
    Comments { post_id: i64 },
    /// Delete a post with its hearts and comments
    Delete { post_id: i64 },
    /// Set profile metadata fields (key=value)
    Profile {
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Replace your profile image
    Avatar { image: PathBuf },
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// SQLite database and a bucket directory under the data dir
    #[default]
    Local,
    /// Supabase-style REST backend
    Hosted,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub client: ClientConfig,
    pub auth: AuthConfig,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RemoteConfig {
    pub backend: Backend,
    pub url: Option<String>,
    pub anon_key: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub cache_control_secs: u64,
    pub public_base_url: Option<String>,
    /// Bucket directory for the local backend
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of local backend sessions
    pub session_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "petagram".to_string(),
            cache_control_secs: 3600,
            public_base_url: None,
            path: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { session_hours: 720 }
    }
}

impl Config {
    pub fn load(args: &ConfigArgs) -> anyhow::Result<Self> {
        let data_dir = Self::data_dir(args);
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        // CLI overrides
        if let Some(backend) = args.backend {
            config.remote.backend = backend;
        }
        if let Some(ref url) = args.url {
            config.remote.url = Some(url.clone());
        }
        if let Some(ref key) = args.anon_key {
            config.remote.anon_key = Some(key.clone());
        }
        if let Some(secs) = args.timeout {
            config.client.request_timeout_secs = secs;
        }

        // Resolve paths relative to data dir
        if config.database.path.is_none() {
            config.database.path = Some(data_dir.join("petagram.db"));
        }
        if config.storage.path.is_none() {
            config.storage.path = Some(data_dir.join("storage"));
        }

        if config.client.request_timeout_secs == 0 {
            anyhow::bail!("client.request_timeout_secs must be at least 1");
        }

        Ok(config)
    }

    pub fn data_dir(args: &ConfigArgs) -> PathBuf {
        args.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".petagram")
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("petagram.db"))
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("storage"))
    }

    /// URL and key for the hosted backend; both must be configured.
    pub fn hosted_endpoint(&self) -> anyhow::Result<(&str, &str)> {
        let url = self
            .remote
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("remote.url is required for the hosted backend"))?;
        let key = self.remote.anon_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!("remote.anon_key is required for the hosted backend")
        })?;
        Ok((url, key))
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            request_timeout: Duration::from_secs(self.client.request_timeout_secs),
            bucket: self.storage.bucket.clone(),
            cache_control_secs: self.storage.cache_control_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_in(dir: &std::path::Path) -> ConfigArgs {
        ConfigArgs {
            data_dir: Some(dir.to_path_buf()),
            ..ConfigArgs::default()
        }
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.remote.backend, Backend::Local);
        assert_eq!(config.storage.bucket, "petagram");
        assert_eq!(config.storage.cache_control_secs, 3600);
        assert_eq!(config.client.request_timeout_secs, 10);
        assert_eq!(config.auth.session_hours, 720);
        assert!(config.database.path.is_none());
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let args = args_in(std::path::Path::new("/tmp/test-petagram"));
        assert_eq!(Config::data_dir(&args), PathBuf::from("/tmp/test-petagram"));
    }

    #[test]
    fn data_dir_defaults_to_home_dot_petagram() {
        let dir = Config::data_dir(&ConfigArgs::default());
        assert!(dir.ends_with(".petagram"));
    }

    #[test]
    fn load_with_no_config_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&args_in(tmp.path())).unwrap();
        assert_eq!(config.remote.backend, Backend::Local);
        assert_eq!(config.db_path(), tmp.path().join("petagram.db"));
        assert_eq!(config.storage_path(), tmp.path().join("storage"));
    }

    #[test]
    fn load_reads_toml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[remote]
backend = "hosted"
url = "https://example.supabase.co"
anon_key = "anon"

[storage]
bucket = "pets"
cache_control_secs = 60

[client]
request_timeout_secs = 3
"#,
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(config_path),
            ..args_in(tmp.path())
        };
        let config = Config::load(&args).unwrap();
        assert_eq!(config.remote.backend, Backend::Hosted);
        assert_eq!(
            config.hosted_endpoint().unwrap(),
            ("https://example.supabase.co", "anon")
        );

        let settings = config.client_settings();
        assert_eq!(settings.bucket, "pets");
        assert_eq!(settings.cache_control_secs, 60);
        assert_eq!(settings.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn cli_overrides_beat_toml_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            r#"
[remote]
backend = "hosted"
url = "https://a.example"

[client]
request_timeout_secs = 30
"#,
        )
        .unwrap();

        let args = ConfigArgs {
            backend: Some(Backend::Local),
            url: Some("https://b.example".to_string()),
            timeout: Some(2),
            ..args_in(tmp.path())
        };
        let config = Config::load(&args).unwrap();
        assert_eq!(config.remote.backend, Backend::Local);
        assert_eq!(config.remote.url.as_deref(), Some("https://b.example"));
        assert_eq!(config.client.request_timeout_secs, 2);
    }

    #[test]
    fn hosted_backend_needs_url_and_key() {
        let config = Config::default();
        assert!(config.hosted_endpoint().is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let args = ConfigArgs {
            timeout: Some(0),
            ..args_in(tmp.path())
        };
        assert!(Config::load(&args).is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from(["petagram", "--backend", "local", "heart", "7"]);
        assert_eq!(cli.args.backend, Some(Backend::Local));
        assert!(matches!(cli.command, Command::Heart { post_id: 7 }));
    }
}
