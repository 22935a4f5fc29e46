//! # Router Module
//!
//! Maps an inbound path to a backend service through an ordered table of path
//! prefixes. The first entry whose prefix matches wins.
//!
//! Matching is segment-aware: `/api/orders` matches `/api/orders` and
//! `/api/orders/42` but not `/api/ordersx`.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<T>` shares the immutable route entries with every request task
//! - Returning borrowed `&str` slices from `strip_prefix` avoids allocating until the
//!   forwarded path is actually built

use std::sync::Arc;
use std::time::Duration;

use crate::core::config::RouteDefinition;
use crate::core::error::GatewayError;

/// One compiled route table entry
#[derive(Debug, Clone)]
pub struct Route {
    /// Prefix without a trailing slash (`/` stays `/`)
    pub prefix: String,
    pub service: String,
    pub strip_prefix: bool,
    pub cacheable: bool,
    pub cache_ttl: Option<Duration>,
}

impl Route {
    fn from_definition(definition: &RouteDefinition) -> Self {
        Self {
            prefix: normalize_prefix(&definition.path_prefix),
            service: definition.service.clone(),
            strip_prefix: definition.strip_prefix,
            cacheable: definition.cacheable,
            cache_ttl: definition.cache_ttl,
        }
    }

    /// Remainder of `path` after this route's prefix, if the prefix matches
    fn remainder<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.prefix == "/" {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    /// Path to append to the instance address
    pub forward_path: String,
}

/// Ordered prefix route table
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(definitions: &[RouteDefinition]) -> Self {
        Self {
            routes: definitions
                .iter()
                .map(|d| Arc::new(Route::from_definition(d)))
                .collect(),
        }
    }

    /// Find the first route matching `path`
    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            let rest = route.remainder(path)?;
            let forward_path = if route.strip_prefix {
                if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                }
            } else {
                path.to_string()
            };
            Some(RouteMatch {
                route: Arc::clone(route),
                forward_path,
            })
        })
    }

    /// Like [`match_path`](Self::match_path) but producing the 404 error on a miss
    pub fn resolve(&self, path: &str) -> Result<RouteMatch, GatewayError> {
        self.match_path(path).ok_or_else(|| GatewayError::RouteNotFound {
            path: path.to_string(),
            prefixes: self.prefixes(),
        })
    }

    /// Configured prefixes in declaration order
    pub fn prefixes(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.prefix.clone()).collect()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
