//! Request classification.
//!
//! Pure function of URL path and request mode; no side effects, no
//! failure modes. Every intercepted request maps to exactly one policy.

use crate::http::RequestMode;

/// Handling policy for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Static asset: serve from cache, fetch only on miss
  CacheFirst,
  /// API call: prefer live data, fall back to cache
  NetworkFirst,
  /// Full-page load: network, then cached page, then offline page
  Navigation,
}

/// Classify a request by path and mode.
///
/// The API prefix wins over navigation mode: an API path is never treated
/// as a navigation, even for a full-page load.
pub fn classify(path: &str, mode: RequestMode, api_prefix: &str) -> Route {
  if path.starts_with(api_prefix) {
    return Route::NetworkFirst;
  }

  if mode == RequestMode::Navigate {
    return Route::Navigation;
  }

  Route::CacheFirst
}
