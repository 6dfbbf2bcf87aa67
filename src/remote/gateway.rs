use std::future::Future;
use std::time::Duration;

use super::{DynRemote, RemoteClient, RemoteResult};
use crate::error::CallError;

/// Remote client plus the uniform call timeout
#[derive(Clone)]
pub struct Gateway {
    remote: DynRemote,
    timeout: Duration,
}

impl Gateway {
    pub fn new(remote: DynRemote, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    pub fn remote(&self) -> &dyn RemoteClient {
        self.remote.as_ref()
    }

    /// Await a remote call, giving up after the configured timeout.
    pub async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, CallError>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        tracing::debug!(operation, "remote call");
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::debug!(operation, status = ?e.status_code, "remote call failed: {}", e);
                Err(CallError::Remote(e))
            }
            Err(_) => {
                tracing::warn!(operation, "remote call timed out after {:?}", self.timeout);
                Err(CallError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }
}
