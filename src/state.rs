//! Coordination state shared between the supervisor and every router instance
//!
//! The supervisor is the only writer: it publishes the engine's base URI once
//! the engine reports readiness and clears it as soon as the engine exits.
//! Routers read the URI on every request and never write it.

use arc_swap::ArcSwap;
use rand::RngCore;
use std::sync::Arc;

/// Request header used to tag traffic the engine sends back to the host
pub const LOOP_HEADER: &str = "x-engine-from";

/// Number of random bytes in the loop-prevention secret
const SECRET_BYTES: usize = 48;

/// Shared reference to the route state
pub type SharedRouteState = Arc<RouteState>;

/// Where (and whether) inbound traffic should be forwarded to the engine
#[derive(Debug)]
pub struct RouteState {
    mount_path: String,
    proxy_uri: ArcSwap<String>,
    loop_secret: String,
    dump_traffic: bool,
}

impl RouteState {
    /// Create a route state with a freshly generated loop-prevention secret
    pub fn new(mount_path: impl Into<String>, dump_traffic: bool) -> Self {
        Self::with_secret(mount_path, generate_secret(), dump_traffic)
    }

    pub fn with_secret(
        mount_path: impl Into<String>,
        loop_secret: impl Into<String>,
        dump_traffic: bool,
    ) -> Self {
        Self {
            mount_path: mount_path.into(),
            proxy_uri: ArcSwap::from_pointee(String::new()),
            loop_secret: loop_secret.into(),
            dump_traffic,
        }
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn loop_secret(&self) -> &str {
        &self.loop_secret
    }

    pub fn dump_traffic(&self) -> bool {
        self.dump_traffic
    }

    /// Current engine base URI; empty when no engine is reachable
    pub fn proxy_uri(&self) -> Arc<String> {
        self.proxy_uri.load_full()
    }

    /// Current engine base URI, or `None` while the engine is unavailable
    pub fn engine_uri(&self) -> Option<Arc<String>> {
        let uri = self.proxy_uri.load_full();
        if uri.is_empty() {
            None
        } else {
            Some(uri)
        }
    }

    /// Check whether a request target addresses the mount path.
    ///
    /// Matches the exact path, or the path followed by a query string.
    pub fn matches_mount(&self, path_and_query: &str) -> bool {
        match path_and_query.strip_prefix(self.mount_path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('?'),
            None => false,
        }
    }

    pub(crate) fn publish(&self, uri: String) {
        self.proxy_uri.store(Arc::new(uri));
    }

    pub(crate) fn clear(&self) {
        self.proxy_uri.store(Arc::new(String::new()));
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
