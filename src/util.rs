//! Shared utility functions.

use std::any::Any;

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run a blocking closure on the blocking pool.
///
/// A panic inside `f` comes back as [`Error::TaskPanicked`] tagged with `name`.
pub async fn blocking<F, T>(name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match spawn_blocking(f).await {
        Ok(inner) => inner,
        Err(join_err) if join_err.is_panic() => Err(Error::TaskPanicked {
            task: name.to_string(),
            message: panic_message(join_err.into_panic().as_ref()),
        }),
        Err(join_err) => Err(Error::TaskJoin(join_err.to_string())),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
