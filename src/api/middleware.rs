// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Body Cipher Middleware
//!
//! Tower layer that decrypts request bodies and encrypts response bodies for
//! routes that opt in through a [`PolicyResolver`].
//!
//! Per request:
//!
//! 1. Resolve the route policy. No direction requested: forward untouched,
//!    without reading any exchange header.
//! 2. Read `X-Server-Key-ID`, `X-Key` and `X-Nonce`; obtain the shared secret
//!    from the [`SecretExchange`] and build a cipher per requested direction.
//! 3. Swap in the wrapped request body, call the handler, wrap its response body.
//!
//! Any failure in step 2 aborts the request: the handler is not called and the
//! [`FailureWriter`] produces the response. A request body that fails to
//! decrypt while the handler reads it is reported the same way; the handler's
//! response is discarded.

use axum::body::Body;
use axum::http::{header, HeaderMap, Request};
use axum::response::Response;
use futures::future::BoxFuture;
use futures::StreamExt;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::headers::{EXCHANGE_HEADERS, X_KEY, X_NONCE, X_SERVER_KEY_ID};
use super::policy::{EncryptionPolicy, PolicyResolver};
use super::result::{FailureWriter, JsonFailureWriter};
use crate::crypto::{
    decode_b64url, BodyCipher, CipherFactory, CipherMode, CipherStream, CryptoError,
    SecretExchange,
};

/// Request outcome counters
#[derive(Debug, Default)]
pub struct MiddlewareStats {
    passthrough: AtomicU64,
    wrapped: AtomicU64,
    aborted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MiddlewareStatsSnapshot {
    pub passthrough: u64,
    pub wrapped: u64,
    pub aborted: u64,
}

impl MiddlewareStats {
    pub fn snapshot(&self) -> MiddlewareStatsSnapshot {
        MiddlewareStatsSnapshot {
            passthrough: self.passthrough.load(Ordering::Relaxed),
            wrapped: self.wrapped.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct Shared {
    exchange: Arc<SecretExchange>,
    factory: Arc<dyn CipherFactory>,
    resolver: Arc<dyn PolicyResolver>,
    failure: Arc<dyn FailureWriter>,
    stats: Arc<MiddlewareStats>,
}

/// Ciphers for one request, one per requested direction
struct CipherContext {
    request: Option<BodyCipher>,
    response: Option<BodyCipher>,
}

impl Shared {
    fn prepare(
        &self,
        headers: &HeaderMap,
        policy: EncryptionPolicy,
    ) -> Result<CipherContext, CryptoError> {
        let missing: Vec<&'static str> = EXCHANGE_HEADERS
            .into_iter()
            .filter(|name| !header_present(headers, name))
            .collect();
        if !missing.is_empty() {
            return Err(CryptoError::MissingExchangeHeaders { missing });
        }

        // Present but not visible ASCII
        let server_key_id = header_text(headers, X_SERVER_KEY_ID).ok_or_else(|| {
            CryptoError::UnknownServerKey {
                key_id: "<non-ASCII>".to_string(),
            }
        })?;
        let peer_key = header_text(headers, X_KEY)
            .ok_or_else(|| CryptoError::invalid_peer_key("X-Key is not ASCII"))?;
        let nonce = header_text(headers, X_NONCE).ok_or_else(|| CryptoError::InvalidNonce {
            reason: "X-Nonce is not ASCII".to_string(),
        })?;

        let iv = decode_b64url(nonce).map_err(|e| CryptoError::InvalidNonce {
            reason: e.to_string(),
        })?;
        if iv.is_empty() {
            return Err(CryptoError::InvalidNonce {
                reason: "nonce is empty".to_string(),
            });
        }

        let secret = self.exchange.shared_secret(peer_key, server_key_id)?;
        let request = if policy.decrypt_request {
            Some(
                self.factory
                    .create_cipher(CipherMode::Decrypt, secret.as_bytes(), &iv)?,
            )
        } else {
            None
        };
        let response = if policy.encrypt_response {
            Some(
                self.factory
                    .create_cipher(CipherMode::Encrypt, secret.as_bytes(), &iv)?,
            )
        } else {
            None
        };
        Ok(CipherContext { request, response })
    }
}

fn header_present(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .map(|value| !value.as_bytes().iter().all(u8::is_ascii_whitespace))
        .unwrap_or(false)
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

/// First error raised while decrypting a request body
type BodyFailure = Arc<OnceCell<CryptoError>>;

/// Swap in the decrypting body. A failure is recorded in the returned slot so
/// the service can replace whatever the handler made of the truncated body.
fn wrap_request(request: Request<Body>, cipher: BodyCipher) -> (Request<Body>, BodyFailure) {
    let (mut parts, body) = request.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    let failure = BodyFailure::default();
    let recorder = failure.clone();
    let stream = CipherStream::new(body.into_data_stream(), cipher).inspect(move |chunk| {
        if let Err(e) = chunk {
            let _ = recorder.set(CryptoError::InvalidRequestBody {
                reason: e.to_string(),
            });
        }
    });
    (
        Request::from_parts(parts, Body::from_stream(stream)),
        failure,
    )
}

fn wrap_response(response: Response, cipher: BodyCipher) -> Response {
    let (mut parts, body) = response.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    let stream = CipherStream::new(body.into_data_stream(), cipher);
    Response::from_parts(parts, Body::from_stream(stream))
}

/// Layer applying [`CipherService`]
#[derive(Clone)]
pub struct CipherLayer {
    shared: Arc<Shared>,
}

impl CipherLayer {
    pub fn new(
        exchange: Arc<SecretExchange>,
        factory: Arc<dyn CipherFactory>,
        resolver: Arc<dyn PolicyResolver>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                exchange,
                factory,
                resolver,
                failure: Arc::new(JsonFailureWriter),
                stats: Arc::new(MiddlewareStats::default()),
            }),
        }
    }

    fn map_shared(self, f: impl FnOnce(&mut Shared)) -> Self {
        let mut shared = Arc::try_unwrap(self.shared).unwrap_or_else(|shared| (*shared).clone());
        f(&mut shared);
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn with_failure_writer(self, failure: Arc<dyn FailureWriter>) -> Self {
        self.map_shared(|shared| shared.failure = failure)
    }

    /// Record outcomes into `stats` (e.g. one shared with a metrics endpoint)
    pub fn with_stats(self, stats: Arc<MiddlewareStats>) -> Self {
        self.map_shared(|shared| shared.stats = stats)
    }

    pub fn stats(&self) -> Arc<MiddlewareStats> {
        self.shared.stats.clone()
    }
}

impl<S> Layer<S> for CipherLayer {
    type Service = CipherService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CipherService {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Service produced by [`CipherLayer`]
#[derive(Clone)]
pub struct CipherService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Body>> for CipherService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // The clone may not be ready; keep the one poll_ready was called on
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(async move {
            let policy = shared.resolver.resolve(&request);
            if !policy.is_active() {
                shared.stats.passthrough.fetch_add(1, Ordering::Relaxed);
                return inner.call(request).await;
            }

            let context = match shared.prepare(request.headers(), policy) {
                Ok(context) => context,
                Err(e) => {
                    shared.stats.aborted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "🔒 Aborted {} {}: {}",
                        request.method(),
                        request.uri().path(),
                        e
                    );
                    return Ok(shared.failure.write_failure(&e));
                }
            };
            debug!(
                "Wrapping {} {} (decrypt_request={}, encrypt_response={})",
                request.method(),
                request.uri().path(),
                policy.decrypt_request,
                policy.encrypt_response
            );
            let method = request.method().clone();
            let path = request.uri().path().to_string();

            let (request, body_failure) = match context.request {
                Some(cipher) => {
                    let (request, failure) = wrap_request(request, cipher);
                    (request, Some(failure))
                }
                None => (request, None),
            };
            let response = inner.call(request).await?;

            if let Some(e) = body_failure.as_ref().and_then(|failure| failure.get()) {
                shared.stats.aborted.fetch_add(1, Ordering::Relaxed);
                warn!("🔒 Request body of {} {} failed to decrypt: {}", method, path, e);
                return Ok(shared.failure.write_failure(e));
            }
            shared.stats.wrapped.fetch_add(1, Ordering::Relaxed);

            Ok(match context.response {
                Some(cipher) => wrap_response(response, cipher),
                None => response,
            })
        })
    }
}
