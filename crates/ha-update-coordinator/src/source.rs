//! Update source adapters
//!
//! An [`UpdateSource`] wraps a vendor client and exposes a single fetch. The
//! coordinator owns the source and never passes it arguments; anything the
//! fetch needs (host, credentials, session) is captured at construction.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use ha_core::{UpdateError, UpdateResult};

/// Capability the coordinator polls
#[async_trait]
pub trait UpdateSource<T>: Send + Sync + 'static {
    /// One-time preparation run before the first refresh (login, discovery)
    async fn setup(&self) -> UpdateResult<()> {
        Ok(())
    }

    /// Fetch a fresh snapshot
    ///
    /// Return [`UpdateError::UpdateFailed`] for transient problems and
    /// [`UpdateError::AuthFailed`] when credentials are rejected.
    async fn fetch(&self) -> UpdateResult<T>;
}

#[async_trait]
impl<T, S> UpdateSource<T> for Arc<S>
where
    T: Send + 'static,
    S: UpdateSource<T> + ?Sized,
{
    async fn setup(&self) -> UpdateResult<()> {
        UpdateSource::<T>::setup(&**self).await
    }

    async fn fetch(&self) -> UpdateResult<T> {
        UpdateSource::<T>::fetch(&**self).await
    }
}

/// Source backed by an async closure
pub struct FnSource<F> {
    update_method: F,
}

/// Wrap an async closure as an update source
pub fn from_fn<T, F, Fut>(update_method: F) -> FnSource<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = UpdateResult<T>> + Send + 'static,
{
    FnSource { update_method }
}

#[async_trait]
impl<T, F, Fut> UpdateSource<T> for FnSource<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = UpdateResult<T>> + Send + 'static,
{
    async fn fetch(&self) -> UpdateResult<T> {
        (self.update_method)().await
    }
}

/// Source backed by a synchronous client
///
/// The client call runs on Tokio's blocking pool so it never stalls the
/// runtime threads that drive every other coordinator.
pub struct BlockingSource<F> {
    update_method: Arc<F>,
}

/// Wrap a blocking closure as an update source
pub fn blocking<T, F>(update_method: F) -> BlockingSource<F>
where
    F: Fn() -> UpdateResult<T> + Send + Sync + 'static,
{
    BlockingSource {
        update_method: Arc::new(update_method),
    }
}

#[async_trait]
impl<T, F> UpdateSource<T> for BlockingSource<F>
where
    T: Send + 'static,
    F: Fn() -> UpdateResult<T> + Send + Sync + 'static,
{
    async fn fetch(&self) -> UpdateResult<T> {
        let update_method = Arc::clone(&self.update_method);
        tokio::task::spawn_blocking(move || update_method())
            .await
            .map_err(|err| UpdateError::failed(format!("Blocking fetch did not complete: {err}")))?
    }
}
