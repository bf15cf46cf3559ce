// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Per-route encryption policy
//!
//! Routes opt in to body encryption. [`RoutePolicies`] declares policies by
//! method and matched route, with prefix-level defaults that an exact route
//! entry overrides. [`StaticPolicy`] pins one policy on a layer applied with
//! `route_layer` to a single route.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Method, Request};
use std::collections::HashMap;

/// Which directions of a request are encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncryptionPolicy {
    /// Encrypt the response body
    pub encrypt_response: bool,
    /// Decrypt the request body
    pub decrypt_request: bool,
}

impl EncryptionPolicy {
    /// Both directions; the default for an opted-in route
    pub const fn both() -> Self {
        Self {
            encrypt_response: true,
            decrypt_request: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            encrypt_response: false,
            decrypt_request: false,
        }
    }

    pub const fn encrypt_only() -> Self {
        Self {
            encrypt_response: true,
            decrypt_request: false,
        }
    }

    pub const fn decrypt_only() -> Self {
        Self {
            encrypt_response: false,
            decrypt_request: true,
        }
    }

    /// Whether any direction needs the key exchange
    pub fn is_active(&self) -> bool {
        self.encrypt_response || self.decrypt_request
    }
}

/// Resolves the policy for an incoming request
pub trait PolicyResolver: Send + Sync {
    fn resolve(&self, request: &Request<Body>) -> EncryptionPolicy;
}

/// One fixed policy for every request it sees
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPolicy(pub EncryptionPolicy);

impl PolicyResolver for StaticPolicy {
    fn resolve(&self, _request: &Request<Body>) -> EncryptionPolicy {
        self.0
    }
}

/// Policy table keyed by method and route template (`/users/:id`, not `/users/7`).
///
/// Lookup order: exact `(method, route)` entry, then the longest matching
/// prefix default, then [`EncryptionPolicy::none`].
#[derive(Debug, Clone, Default)]
pub struct RoutePolicies {
    routes: HashMap<(Method, String), EncryptionPolicy>,
    prefixes: Vec<(String, EncryptionPolicy)>,
}

impl RoutePolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for one method on one route
    pub fn route(mut self, method: Method, route: impl Into<String>, policy: EncryptionPolicy) -> Self {
        self.routes.insert((method, route.into()), policy);
        self
    }

    /// Default for every route under `prefix`, any method
    pub fn prefix(mut self, prefix: impl Into<String>, policy: EncryptionPolicy) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        self.prefixes.retain(|(existing, _)| *existing != prefix);
        self.prefixes.push((prefix, policy));
        // Longest first so the most specific default wins
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn policy_for(&self, method: &Method, route: &str) -> EncryptionPolicy {
        if let Some(policy) = self.routes.get(&(method.clone(), route.to_string())) {
            return *policy;
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| under_prefix(route, prefix))
            .map(|(_, policy)| *policy)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.prefixes.is_empty()
    }
}

fn under_prefix(route: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match route.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl PolicyResolver for RoutePolicies {
    fn resolve(&self, request: &Request<Body>) -> EncryptionPolicy {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str())
            .unwrap_or_else(|| request.uri().path());
        self.policy_for(request.method(), route)
    }
}
