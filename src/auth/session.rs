use serde_json::Value;
use tokio::sync::watch;

use crate::error::{AppError, AppResult, CallError};
use crate::models::{Metadata, Session};
use crate::remote::Gateway;
use crate::upload::{UploadFile, UploadMode, UploadPipeline};

/// Where the UI goes after a successful login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationTarget {
    RiderDashboard,
    PassengerDashboard,
}

impl NavigationTarget {
    pub fn for_session(session: &Session) -> Self {
        if session.is_driver() {
            Self::RiderDashboard
        } else {
            Self::PassengerDashboard
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RiderDashboard => "rider-dashboard",
            Self::PassengerDashboard => "passenger-dashboard",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::RiderDashboard => "/system/rider-dashboard",
            Self::PassengerDashboard => "/system/passenger-dashboard",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Authenticated {
    pub session: Session,
    pub redirect: NavigationTarget,
}

/// Owns the signed-in identity for one UI session.
pub struct SessionManager {
    gateway: Gateway,
    state: watch::Sender<Option<Session>>,
}

impl SessionManager {
    pub fn new(gateway: Gateway) -> Self {
        let (state, _) = watch::channel(None);
        Self { gateway, state }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    /// Current session or `Unauthenticated`, checked before any remote call.
    pub fn require(&self) -> AppResult<Session> {
        self.current_session().ok_or(AppError::Unauthenticated)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    fn replace(&self, session: Option<Session>) {
        self.state.send_replace(session);
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> AppResult<Authenticated> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AppError::Validation(
                "email and password are required".to_string(),
            ));
        }

        let remote = self.gateway.remote();
        let user = match self
            .gateway
            .call("auth.sign_in", remote.sign_in(email.trim(), password))
            .await
        {
            Ok(user) => user,
            Err(err) => {
                self.replace(None);
                return Err(match err {
                    CallError::Remote(e) => AppError::Auth {
                        reason: e.message,
                        status_code: e.status_code,
                    },
                    timeout => timeout.into(),
                });
            }
        };

        let session = Session::from_identity(user);
        let redirect = NavigationTarget::for_session(&session);
        tracing::info!(
            "Signed in {} as {:?}, redirecting to {}",
            session.user_id,
            session.role,
            redirect.name()
        );
        self.replace(Some(session.clone()));

        Ok(Authenticated { session, redirect })
    }

    /// Re-derive the session from the remote's current token. Returns
    /// whether a valid session exists.
    pub async fn refresh_from_remote(&self) -> AppResult<bool> {
        let remote = self.gateway.remote();
        let user = self
            .gateway
            .call("auth.get_session", remote.get_session())
            .await?;

        let exists = user.is_some();
        self.replace(user.map(Session::from_identity));
        Ok(exists)
    }

    /// Re-read the user record from the remote.
    pub async fn load_user_information(&self) -> AppResult<Session> {
        let remote = self.gateway.remote();
        let user = self.gateway.call("auth.get_user", remote.get_user()).await?;

        let session = Session::from_identity(user);
        self.replace(Some(session.clone()));
        Ok(session)
    }

    /// Merge `fields` into the remote metadata; the local session is only
    /// replaced once the remote accepts the change.
    pub async fn update_profile(&self, fields: Metadata) -> AppResult<Session> {
        self.require()?;

        let remote = self.gateway.remote();
        let user = self
            .gateway
            .call("auth.update_user", remote.update_user(fields))
            .await
            .map_err(|cause| AppError::Update { cause })?;

        let session = Session::from_identity(user);
        self.replace(Some(session.clone()));
        tracing::info!("Updated profile for {}", session.user_id);
        Ok(session)
    }

    /// Upload a new profile image (overwriting the previous one) and point
    /// the profile at it. An upload failure leaves the profile untouched;
    /// an update failure leaves the new image stored.
    pub async fn update_profile_image(
        &self,
        uploads: &UploadPipeline,
        file: UploadFile,
    ) -> AppResult<Session> {
        self.require()?;
        let url = uploads.upload(file, UploadMode::ProfileImage).await?;

        let mut fields = Metadata::new();
        fields.insert("image_url".to_string(), Value::String(url));
        self.update_profile(fields).await
    }

    pub async fn logout(&self) -> AppResult<()> {
        let remote = self.gateway.remote();
        let result = self.gateway.call("auth.sign_out", remote.sign_out()).await;
        self.replace(None);
        result.map_err(AppError::from)
    }

    /// Drop the local session without contacting the remote.
    pub fn reset(&self) {
        self.replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, UserId};
    use crate::remote::AuthUser;

    fn session(metadata: Value) -> Session {
        Session::from_identity(AuthUser {
            id: "u1".into(),
            email: Some("a@b.c".into()),
            user_metadata: metadata.as_object().cloned().unwrap_or_default(),
        })
    }

    #[test]
    fn driver_goes_to_rider_dashboard() {
        let target = NavigationTarget::for_session(&session(serde_json::json!({"is_driver": true})));
        assert_eq!(target, NavigationTarget::RiderDashboard);
        assert_eq!(target.name(), "rider-dashboard");
        assert_eq!(target.path(), "/system/rider-dashboard");
    }

    #[test]
    fn everyone_else_goes_to_passenger_dashboard() {
        for metadata in [
            serde_json::json!({}),
            serde_json::json!({"is_driver": false}),
            serde_json::json!({"is_driver": "true"}),
        ] {
            let target = NavigationTarget::for_session(&session(metadata));
            assert_eq!(target, NavigationTarget::PassengerDashboard);
        }
    }

    #[test]
    fn session_carries_identity() {
        let s = session(serde_json::json!({"is_admin": true}));
        assert_eq!(s.user_id, UserId::new("u1"));
        assert_eq!(s.role, Role::SuperAdministrator);
    }
}
