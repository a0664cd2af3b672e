//! Connection lifecycle hooks.
//!
//! Hooks are handler objects injected through the
//! [`PoolBuilder`](crate::PoolBuilder). Each one receives the connection it is
//! invoked for; a hook returning `Err` fails the surrounding pool operation.
//!
//! Callbacks for one holder run strictly in sequence
//! (`on_connect` then `on_acquire`, later `on_release`). Callbacks for
//! different holders may interleave.

use std::fmt;
use std::sync::Arc;

use edb_client::{BoxError, Connection};

use crate::error::PoolError;

/// Trait for connection lifecycle hooks.
///
/// Closures of shape `Fn(&Connection) -> Result<(), BoxError>` implement this
/// trait; implement it directly when the hook has to await.
#[async_trait::async_trait]
pub trait ConnectionHook: Send + Sync {
    /// Invoke the hook for `connection`.
    async fn call(&self, connection: &Connection) -> Result<(), BoxError>;
}

#[async_trait::async_trait]
impl<F> ConnectionHook for F
where
    F: Fn(&Connection) -> Result<(), BoxError> + Send + Sync,
{
    async fn call(&self, connection: &Connection) -> Result<(), BoxError> {
        self(connection)
    }
}

/// The hooks a pool runs around connection lifecycle events.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Runs once per newly established physical connection.
    pub on_connect: Option<Arc<dyn ConnectionHook>>,
    /// Runs every time a connection is handed out.
    pub on_acquire: Option<Arc<dyn ConnectionHook>>,
    /// Runs every time a connection is handed back.
    pub on_release: Option<Arc<dyn ConnectionHook>>,
}

impl Hooks {
    pub(crate) async fn on_connect(&self, connection: &Connection) -> Result<(), PoolError> {
        run_hook("on_connect", self.on_connect.as_deref(), connection).await
    }

    pub(crate) async fn on_acquire(&self, connection: &Connection) -> Result<(), PoolError> {
        run_hook("on_acquire", self.on_acquire.as_deref(), connection).await
    }

    pub(crate) async fn on_release(&self, connection: &Connection) -> Result<(), PoolError> {
        run_hook("on_release", self.on_release.as_deref(), connection).await
    }
}

async fn run_hook(
    name: &'static str,
    hook: Option<&dyn ConnectionHook>,
    connection: &Connection,
) -> Result<(), PoolError> {
    let Some(hook) = hook else {
        return Ok(());
    };
    hook.call(connection).await.map_err(|source| {
        tracing::debug!(connection = connection.id(), hook = name, error = %source, "hook failed");
        PoolError::Hook { hook: name, source }
    })
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_acquire", &self.on_acquire.is_some())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}
