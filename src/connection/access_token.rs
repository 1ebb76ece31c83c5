use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{error::Result, options::AccessTokenProvider};

/// The access token of one physical connection.
///
/// The provider is called lazily on first use and again on [`refresh`]. A
/// token handed out by a negotiate redirect replaces the cached one.
///
/// [`refresh`]: AccessTokenHandle::refresh
#[derive(Clone)]
pub struct AccessTokenHandle {
    provider: Option<AccessTokenProvider>,
    // Outer `None`: not fetched yet.
    cached: Arc<Mutex<Option<Option<String>>>>,
}

impl AccessTokenHandle {
    pub fn new(provider: Option<AccessTokenProvider>) -> Self {
        Self {
            provider,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn get(&self) -> Result<Option<String>> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = match &self.provider {
            Some(provider) => provider().await?,
            None => None,
        };
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Asks the provider for a new token. Returns `false` if there is no provider.
    pub async fn refresh(&self) -> Result<bool> {
        let Some(provider) = &self.provider else {
            return Ok(false);
        };
        let token = provider().await?;
        *self.cached.lock().await = Some(token);
        Ok(true)
    }

    pub async fn adopt(&self, token: String) {
        *self.cached.lock().await = Some(Some(token));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;

    use super::*;

    fn counting_provider() -> (AccessTokenProvider, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider: AccessTokenProvider = Arc::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Some(format!("token-{n}"))) }.boxed()
        });
        (provider, calls)
    }

    #[tokio::test]
    async fn token_is_cached_until_refresh() {
        let (provider, calls) = counting_provider();
        let handle = AccessTokenHandle::new(Some(provider));

        assert_eq!(handle.get().await.unwrap().as_deref(), Some("token-0"));
        assert_eq!(handle.get().await.unwrap().as_deref(), Some("token-0"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(handle.refresh().await.unwrap());
        assert_eq!(handle.get().await.unwrap().as_deref(), Some("token-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn redirect_token_replaces_cached_token() {
        let (provider, _) = counting_provider();
        let handle = AccessTokenHandle::new(Some(provider));
        handle.adopt("redirected".into()).await;
        assert_eq!(handle.get().await.unwrap().as_deref(), Some("redirected"));
    }

    #[tokio::test]
    async fn no_provider() {
        let handle = AccessTokenHandle::new(None);
        assert_eq!(handle.get().await.unwrap(), None);
        assert!(!handle.refresh().await.unwrap());
    }
}
