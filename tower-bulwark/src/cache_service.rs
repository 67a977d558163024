use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use bulwark::CacheKey;
use bulwark::CacheStore;
use bulwark::Invalidation;
use tower::BoxError;
use tower::Service;
use tracing::debug;
use tracing::warn;

use crate::events::Events;
use crate::request::ApiRequest;
use crate::request::ApiResponse;
use crate::request::CacheContext;
use crate::request::ResponseSource;

pub struct CacheService<S> {
    pub(crate) inner: S,
    pub(crate) store: Arc<CacheStore<ApiResponse>>,
    pub(crate) default_ttl: Duration,
    pub(crate) read_through: bool,
    pub(crate) events: Events,
}

impl<S: Clone> Clone for CacheService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            store: Arc::clone(&self.store),
            default_ttl: self.default_ttl,
            read_through: self.read_through,
            events: self.events.clone(),
        }
    }
}

/// How one call interacts with the cache.
enum Plan {
    /// Read-through: look up, and store a successful result.
    Read { key: CacheKey, ttl: Duration },
    /// Cache bypassed, but a fallback may still be served on failure.
    Bypass { key: Option<CacheKey> },
    /// A mutation: invalidate on success.
    Mutate,
}

impl<S> CacheService<S> {
    fn plan(&self, req: &ApiRequest) -> Plan {
        if req.is_mutation() {
            return Plan::Mutate;
        }
        let cache = &req.options.cache;
        let fallback_key = cache.fallback_on_error.then(|| req.cache_key());
        if !self.read_through || !req.is_read_only() || req.options.no_cache || !cache.use_cache {
            return Plan::Bypass { key: fallback_key };
        }
        Plan::Read {
            key: req.cache_key(),
            ttl: cache.ttl.unwrap_or(self.default_ttl),
        }
    }
}

fn invalidate_after(store: &CacheStore<ApiResponse>, req: &ApiRequest) {
    let mut removed = store.invalidate(&Invalidation::Prefix(req.path.clone()));
    for prefix in &req.options.invalidate {
        removed += store.invalidate(&Invalidation::Prefix(prefix.clone()));
    }
    debug!(method = %req.method, path = %req.path, removed, "mutation invalidated cache");
}

fn serve_fallback(
    store: &CacheStore<ApiResponse>,
    key: &CacheKey,
    err: BoxError,
) -> Result<ApiResponse, BoxError> {
    match store.fallback(key) {
        Some((response, age)) => {
            warn!(%key, age_ms = age.as_millis() as u64, error = %err, "serving cached fallback");
            Ok(response.with_source(ResponseSource::Fallback { age }))
        }
        None => Err(err),
    }
}

impl<S> Service<ApiRequest> for CacheService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ApiResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<ApiResponse, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let plan = self.plan(&req);

        Box::pin(async move {
            match plan {
                Plan::Mutate => {
                    let response = inner.call(req.clone()).await?;
                    invalidate_after(&store, &req);
                    events.success(&req, &response);
                    Ok(response)
                }
                Plan::Bypass { key } => match inner.call(req).await {
                    Ok(response) => Ok(response),
                    Err(err) => match key {
                        Some(key) => serve_fallback(&store, &key, err),
                        None => Err(err),
                    },
                },
                Plan::Read { key, ttl } => {
                    if let Some(hit) = store.lookup(&key) {
                        events.cache_hit(&req.path);
                        return Ok(hit.with_source(ResponseSource::Cache));
                    }
                    events.cache_miss(&req.path);

                    let fallback = req.options.cache.fallback_on_error;
                    let should_cache = req.options.cache.should_cache.clone();
                    match inner.call(req.clone()).await {
                        Ok(response) => {
                            let storable = response.is_success()
                                && should_cache.is_none_or(|predicate| {
                                    predicate(&CacheContext {
                                        request: &req,
                                        response: &response,
                                    })
                                });
                            if storable {
                                store.store(key, response.clone(), ttl);
                            }
                            Ok(response)
                        }
                        Err(err) if fallback => serve_fallback(&store, &key, err),
                        Err(err) => Err(err),
                    }
                }
            }
        })
    }
}
