//! Scoped backend sessions
//!
//! Every repository operation runs inside a [`SessionGuard`]: open, work,
//! then [`finish`](SessionGuard::finish) which closes the session whatever
//! the outcome. A guard dropped without finishing (an abandoned future, a
//! dropped stream) spawns the close on the current runtime.

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::backend::{BackendSession, DocumentBackend};
use crate::error::{BackendError, BackendErrorKind, StoreError};
use crate::Result;

/// Translate a backend failure at the repository boundary.
pub(crate) fn translate(err: BackendError, id: Option<&str>) -> StoreError {
    let id = || id.unwrap_or_default().to_string();
    match err.kind {
        BackendErrorKind::NotFound => StoreError::NotFound { id: id() },
        BackendErrorKind::Duplicate => StoreError::AlreadyExists { id: id() },
        BackendErrorKind::Conflict => StoreError::ConcurrentUpdate {
            id: id(),
            reason: err.message,
        },
        BackendErrorKind::Unavailable => StoreError::Connection(err.message),
        BackendErrorKind::Other => StoreError::Backend(err.message),
    }
}

/// An open backend session that is closed on every exit path.
pub(crate) struct SessionGuard {
    session: Option<Box<dyn BackendSession>>,
}

impl SessionGuard {
    pub async fn open(backend: &dyn DocumentBackend) -> Result<Self> {
        let session = backend
            .open_session()
            .await
            .map_err(|e| translate(e, None))?;
        Ok(Self {
            session: Some(session),
        })
    }

    pub fn session(&mut self) -> Result<&mut (dyn BackendSession + 'static)> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(StoreError::Backend("session already closed".into())),
        }
    }

    /// Close the session and return `result`; a close failure only surfaces
    /// when the work itself succeeded.
    pub async fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let closed = self.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "session close failed after error");
                }
                Err(e)
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self.session.take() {
            Some(mut session) => session.close().await.map_err(|e| translate(e, None)),
            None => Ok(()),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                debug!("closing abandoned session");
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!(error = %e, "failed to close abandoned session");
                    }
                });
            }
            Err(_) => warn!("session abandoned outside a runtime; not closed"),
        }
    }
}
