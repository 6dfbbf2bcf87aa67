use std::sync::Arc;

use super::session::{NavigationTarget, SessionManager};
use crate::error::AppError;

pub const LOGIN_SUCCESS_MESSAGE: &str = "Successfully Logged Account.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

impl LoginForm {
    /// Field-level checks run before anything is sent.
    pub fn validate(&self) -> Result<(), String> {
        if self.email.trim().is_empty() {
            return Err("Email is required".to_string());
        }
        if !self.email.contains('@') {
            return Err("Email must be a valid address".to_string());
        }
        if self.password.is_empty() {
            return Err("Password is required".to_string());
        }
        Ok(())
    }
}

/// Progress and outcome flags shown next to the form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormAction {
    pub processing: bool,
    pub error_message: Option<String>,
    pub status_code: Option<u16>,
    pub success_message: Option<String>,
}

/// Login form state plus the submit handler.
pub struct LoginFlow {
    session: Arc<SessionManager>,
    pub form: LoginForm,
    pub action: FormAction,
}

impl LoginFlow {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            form: LoginForm::default(),
            action: FormAction::default(),
        }
    }

    /// Validate, sign in and report the outcome through `action`. The form
    /// is cleared whatever happens. Returns the redirect on success.
    pub async fn submit(&mut self) -> Option<NavigationTarget> {
        self.action = FormAction {
            processing: true,
            ..FormAction::default()
        };

        let redirect = match self.form.validate() {
            Err(message) => {
                self.action.error_message = Some(message);
                None
            }
            Ok(()) => match self
                .session
                .authenticate(&self.form.email, &self.form.password)
                .await
            {
                Ok(authenticated) => {
                    self.action.success_message = Some(LOGIN_SUCCESS_MESSAGE.to_string());
                    Some(authenticated.redirect)
                }
                Err(err) => {
                    self.action.status_code = err.status_code();
                    self.action.error_message = Some(match err {
                        AppError::Auth { reason, .. } => reason,
                        other => other.to_string(),
                    });
                    None
                }
            },
        };

        self.form = LoginForm::default();
        self.action.processing = false;
        redirect
    }
}
