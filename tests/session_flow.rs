mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use common::{context_with, driver, metadata, FaultyRemote, Fixture, PASSWORD};
use petagram::auth::login::LOGIN_SUCCESS_MESSAGE;
use petagram::auth::{LoginFlow, LoginForm, NavigationTarget};
use petagram::models::Role;
use petagram::upload::UploadFile;
use petagram::AppError;

fn flow_for(ctx: &petagram::AppContext, email: &str, password: &str) -> LoginFlow {
    let mut flow = LoginFlow::new(Arc::clone(&ctx.session));
    flow.form = LoginForm {
        email: email.to_string(),
        password: password.to_string(),
    };
    flow
}

#[tokio::test]
async fn test_driver_login_redirects_to_rider_dashboard() {
    let fx = Fixture::new();
    fx.user("rider@example.com", driver());
    let ctx = fx.context();

    let mut flow = flow_for(&ctx, "rider@example.com", PASSWORD);
    let target = flow.submit().await;

    assert_eq!(target, Some(NavigationTarget::RiderDashboard));
    assert_eq!(target.map(|t| t.path()), Some("/system/rider-dashboard"));
    assert_eq!(
        flow.action.success_message.as_deref(),
        Some(LOGIN_SUCCESS_MESSAGE)
    );
    assert!(!flow.action.processing);
    assert_eq!(flow.form, LoginForm::default(), "form is cleared after submit");
    assert!(ctx.session.current_session().is_some());
}

#[tokio::test]
async fn test_passenger_login_redirects_to_passenger_dashboard() {
    let fx = Fixture::new();
    fx.user("plain@example.com", json!({}));
    fx.user("walker@example.com", json!({"is_driver": false}));

    for email in ["plain@example.com", "walker@example.com"] {
        let ctx = fx.context();
        let mut flow = flow_for(&ctx, email, PASSWORD);
        assert_eq!(flow.submit().await, Some(NavigationTarget::PassengerDashboard));
    }
}

#[tokio::test]
async fn test_bad_password_reports_error_and_clears_form() {
    let fx = Fixture::new();
    fx.user("a@example.com", json!({}));
    let ctx = fx.context();

    let mut flow = flow_for(&ctx, "a@example.com", "wrong");
    assert_eq!(flow.submit().await, None);

    assert_eq!(
        flow.action.error_message.as_deref(),
        Some("Invalid login credentials")
    );
    assert_eq!(flow.action.status_code, Some(400));
    assert!(flow.action.success_message.is_none());
    assert_eq!(flow.form, LoginForm::default());
    assert!(ctx.session.current_session().is_none());
}

#[tokio::test]
async fn test_invalid_form_never_reaches_remote() {
    let fx = Fixture::new();
    let faulty = FaultyRemote::new(fx.remote());
    faulty.fail("sign_in:auth");
    let ctx = context_with(faulty.clone(), Duration::from_secs(5));

    let mut flow = flow_for(&ctx, "", "");
    assert_eq!(flow.submit().await, None);
    // The injected remote failure would have produced a 500
    assert_eq!(flow.action.error_message.as_deref(), Some("Email is required"));
    assert_eq!(flow.action.status_code, None);
}

#[tokio::test]
async fn test_admin_flag_overrides_declared_role() {
    let fx = Fixture::new();
    fx.user(
        "boss@example.com",
        json!({"is_admin": true, "user_role": "driver"}),
    );
    let ctx = fx.context();

    let auth = assert_ok!(ctx.session.authenticate("boss@example.com", PASSWORD).await);
    assert_eq!(auth.session.role, Role::SuperAdministrator);
    assert_eq!(auth.session.role.label(), "Super Administrator");
}

#[tokio::test]
async fn test_sign_in_timeout_is_reported_as_timeout() {
    let fx = Fixture::new();
    fx.user("slow@example.com", json!({}));
    let faulty = FaultyRemote::new(fx.remote());
    faulty.hang("sign_in:auth");
    let ctx = context_with(faulty.clone(), Duration::from_millis(50));

    let err = assert_err!(ctx.session.authenticate("slow@example.com", PASSWORD).await);
    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
    assert!(ctx.session.current_session().is_none());
}

#[tokio::test]
async fn test_update_profile_merges_metadata() {
    let fx = Fixture::new();
    fx.user("p@example.com", json!({"user_role": "owner", "nickname": "old"}));
    let ctx = fx.signed_in("p@example.com").await;

    let session = ctx
        .session
        .update_profile(metadata(json!({"nickname": "Rex's human"})))
        .await
        .unwrap();

    assert_eq!(session.metadata["nickname"], json!("Rex's human"));
    assert_eq!(session.metadata["user_role"], json!("owner"));
    assert_eq!(ctx.session.current_session(), Some(session));

    // Another client reads the stored record
    let other = fx.signed_in("p@example.com").await;
    let reloaded = other.session.load_user_information().await.unwrap();
    assert_eq!(reloaded.metadata["nickname"], json!("Rex's human"));
}

#[tokio::test]
async fn test_update_profile_requires_session() {
    let fx = Fixture::new();
    let ctx = fx.context();

    let err = ctx
        .session
        .update_profile(metadata(json!({"nickname": "x"})))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated));
}

#[tokio::test]
async fn test_failed_profile_update_keeps_local_session() {
    let fx = Fixture::new();
    fx.user("p@example.com", json!({"nickname": "old"}));
    let faulty = FaultyRemote::new(fx.remote());
    let ctx = context_with(faulty.clone(), Duration::from_secs(5));
    ctx.session.authenticate("p@example.com", PASSWORD).await.unwrap();
    let before = ctx.session.current_session();

    faulty.fail("update_user:auth");
    let err = ctx
        .session
        .update_profile(metadata(json!({"nickname": "new"})))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Update { .. }));
    assert_eq!(ctx.session.current_session(), before);
}

#[tokio::test]
async fn test_profile_image_overwrites_previous_avatar() {
    let fx = Fixture::new();
    let user_id = fx.user("pic@example.com", json!({}));
    let ctx = fx.signed_in("pic@example.com").await;

    let first = ctx
        .session
        .update_profile_image(&ctx.uploads, UploadFile::new("Me.PNG", vec![1u8, 2, 3]))
        .await
        .unwrap();
    let url = first.image_url().unwrap().to_string();
    assert!(url.ends_with(&format!("petagram/avatars/{}-avatar.png", user_id)));

    let second = ctx
        .session
        .update_profile_image(&ctx.uploads, UploadFile::new("me.png", vec![9u8]))
        .await
        .unwrap();
    assert_eq!(second.image_url(), Some(url.as_str()));

    let stored = fx
        .dir
        .path()
        .join("storage/petagram/avatars")
        .join(format!("{}-avatar.png", user_id));
    assert_eq!(std::fs::read(stored).unwrap(), vec![9u8]);
}

#[tokio::test]
async fn test_refresh_and_logout() {
    let fx = Fixture::new();
    fx.user("x@example.com", json!({}));
    let ctx = fx.signed_in("x@example.com").await;
    let mut sessions = ctx.session.subscribe();

    assert!(ctx.session.refresh_from_remote().await.unwrap());

    ctx.logout().await.unwrap();
    assert!(ctx.session.current_session().is_none());
    assert!(sessions.borrow_and_update().is_none());
    assert!(!ctx.session.refresh_from_remote().await.unwrap());
    assert!(ctx.feed.entries().is_empty());
    assert!(ctx.interactions.hearted().is_empty());
}
