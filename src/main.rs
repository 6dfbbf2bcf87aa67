use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use petagram::auth::{LoginFlow, LoginForm, NavigationTarget};
use petagram::config::{Backend, Cli, Command, Config, ConfigArgs};
use petagram::feed::FeedEntry;
use petagram::models::{Metadata, PostId};
use petagram::remote::{DynRemote, HostedRemote, LocalBackend};
use petagram::upload::UploadFile;
use petagram::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli.args);
    std::fs::create_dir_all(&data_dir)?;
    tracing::debug!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli.args)?;
    let (remote, local) = open_remote(&config)?;
    let ctx = AppContext::new(remote, config.client_settings());

    match cli.command {
        Command::Signup {
            new_email,
            new_password,
            driver,
        } => {
            let backend = local.context("signup is only available with the local backend")?;
            let mut metadata = Metadata::new();
            metadata.insert("is_driver".to_string(), Value::Bool(driver));
            let id = backend.create_user(&new_email, &new_password, metadata)?;
            println!("Registered {} ({})", new_email, id);
        }
        Command::Whoami => {
            let target = sign_in(&ctx, &cli.args).await?;
            let session = ctx.session.require()?;
            println!("{} <{}>", session.user_id, session.email);
            println!("role: {}", session.role.label());
            println!("home: {}", target.path());
        }
        Command::Feed => {
            if cli.args.email.is_some() {
                sign_in(&ctx, &cli.args).await?;
            }
            ctx.hydrate().await?;
            let hearted = ctx.interactions.hearted();
            for entry in ctx.feed.entries() {
                if let FeedEntry::Committed(post) = entry {
                    let mark = if hearted.contains(&post.id) { "♥" } else { " " };
                    println!(
                        "{} #{:<5} {:>3} hearts {:>3} comments  {}  {}",
                        mark,
                        post.id,
                        post.heart_count,
                        post.comment_count,
                        post.image_url,
                        post.caption
                    );
                }
            }
        }
        Command::Post { image, caption } => {
            sign_in(&ctx, &cli.args).await?;
            let file = UploadFile::read(&image)
                .await
                .with_context(|| format!("reading {}", image.display()))?;
            let post = ctx.publish(file, &caption).await?;
            println!("Posted #{} {}", post.id, post.image_url);
        }
        Command::Heart { post_id } => {
            sign_in(&ctx, &cli.args).await?;
            let state = ctx.interactions.toggle_heart(PostId::new(post_id)).await?;
            println!(
                "Post #{} {}",
                post_id,
                if state.is_hearted() { "hearted" } else { "unhearted" }
            );
        }
        Command::Comment { post_id, content } => {
            sign_in(&ctx, &cli.args).await?;
            let comment = ctx
                .interactions
                .add_comment(PostId::new(post_id), &content)
                .await?;
            println!("Comment #{} added to post #{}", comment.id.0, post_id);
        }
        Command::Comments { post_id } => {
            let thread = ctx.interactions.load_comments(PostId::new(post_id)).await?;
            for comment in thread {
                println!(
                    "{} {}: {}",
                    comment.created_at.format("%Y-%m-%d %H:%M"),
                    comment.author_id,
                    comment.content
                );
            }
        }
        Command::Delete { post_id } => {
            sign_in(&ctx, &cli.args).await?;
            ctx.delete_post(PostId::new(post_id)).await?;
            println!("Deleted post #{}", post_id);
        }
        Command::Profile { fields } => {
            sign_in(&ctx, &cli.args).await?;
            let session = ctx.session.update_profile(parse_fields(&fields)?).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&Value::Object(session.metadata))?
            );
        }
        Command::Avatar { image } => {
            sign_in(&ctx, &cli.args).await?;
            let file = UploadFile::read(&image)
                .await
                .with_context(|| format!("reading {}", image.display()))?;
            let session = ctx.session.update_profile_image(&ctx.uploads, file).await?;
            println!("Profile image: {}", session.image_url().unwrap_or_default());
        }
    }

    Ok(())
}

fn open_remote(config: &Config) -> anyhow::Result<(DynRemote, Option<Arc<LocalBackend>>)> {
    match config.remote.backend {
        Backend::Local => {
            let storage = config.storage_path();
            let mut backend = LocalBackend::open(&config.db_path(), &storage)?
                .with_session_hours(config.auth.session_hours);
            if let Some(ref base) = config.storage.public_base_url {
                backend = backend.with_public_base_url(base)?;
            }
            tracing::info!("Using local backend at {}", config.db_path().display());

            let backend = Arc::new(backend);
            let remote: DynRemote = Arc::new(backend.client());
            Ok((remote, Some(backend)))
        }
        Backend::Hosted => {
            let (url, key) = config.hosted_endpoint()?;
            tracing::info!("Using hosted backend at {}", url);
            let remote: DynRemote = Arc::new(HostedRemote::new(url, key)?);
            Ok((remote, None))
        }
    }
}

async fn sign_in(ctx: &AppContext, args: &ConfigArgs) -> anyhow::Result<NavigationTarget> {
    let mut flow = LoginFlow::new(Arc::clone(&ctx.session));
    flow.form = LoginForm {
        email: args.email.clone().unwrap_or_default(),
        password: args.password.clone().unwrap_or_default(),
    };

    match flow.submit().await {
        Some(target) => {
            if let Some(message) = flow.action.success_message {
                tracing::info!("{}", message);
            }
            Ok(target)
        }
        None => {
            let message = flow
                .action
                .error_message
                .unwrap_or_else(|| "login failed".to_string());
            match flow.action.status_code {
                Some(code) => anyhow::bail!("{} (status {})", message, code),
                None => anyhow::bail!(message),
            }
        }
    }
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn parse_fields(fields: &[String]) -> anyhow::Result<Metadata> {
    let mut metadata = Metadata::new();
    for field in fields {
        let (key, raw) = field
            .split_once('=')
            .with_context(|| format!("expected key=value, got {:?}", field))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        metadata.insert(key.trim().to_string(), value);
    }
    Ok(metadata)
}
