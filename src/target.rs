//! Request target helpers.
//!
//! The wrapper only ever sees a finished absolute URL. These helpers build
//! one from its parts and append the cache-busting parameter used when a
//! wrapper is created with `bypass_cache(true)`.

use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::Url;

use crate::{Result, WrapperError};

/// Query parameter carrying the cache-busting value.
pub const CACHE_BUSTER_PARAM: &str = "_";

static BUSTER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Parses a destination into an absolute URL.
pub fn parse(destination: &str) -> Result<Url> {
    let destination = destination.trim();
    if destination.is_empty() {
        return Err(WrapperError::MissingArgument("destination"));
    }
    Url::parse(destination).map_err(|_| WrapperError::InvalidArgumentType {
        field: "destination".to_owned(),
        expected: "an absolute URI",
    })
}

/// Combines a base URL with a path, keeping exactly one `/` between them.
///
/// Example: `join("http://localhost/api/", "/users")` yields
/// `http://localhost/api/users`.
pub fn join(base: &str, path: &str) -> Result<Url> {
    let base = base.trim().trim_end_matches('/');
    let path = path.trim().trim_start_matches('/');
    if path.is_empty() {
        return parse(base);
    }
    parse(&format!("{base}/{path}"))
}

/// Appends a value that is unique for every call, so intermediaries cannot
/// answer the request from a cache.
pub fn bust_cache(url: &mut Url) {
    let sequence = BUSTER_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let value = format!("{}-{sequence}", now_millis());
    url.query_pairs_mut().append_pair(CACHE_BUSTER_PARAM, &value);
}

#[cfg(not(target_arch = "wasm32"))]
fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}

// std::time::SystemTime panics on wasm32-unknown-unknown.
#[cfg(target_arch = "wasm32")]
fn now_millis() -> u128 {
    js_sys::Date::now() as u128
}
