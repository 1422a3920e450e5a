//! Rate limit key generation.
//!
//! A limiter never sees the HTTP request itself, only a [`RequestInfo`]. The
//! key generator decides which requests share a quota.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The parts of an inbound request that key generators may look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Address of the client, if known
    pub client_addr: Option<IpAddr>,
    /// Identity of the authenticated user, if any
    pub user_id: Option<String>,
    /// Route path (the matched route template when available)
    pub path: String,
    /// HTTP method
    pub method: String,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Computes the quota key for a request.
pub type KeyGenerator = Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>;

/// Built-in key generators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One quota per client address
    #[default]
    ClientAddr,
    /// One quota per authenticated user; anonymous requests fall back to
    /// their client address
    User,
    /// One quota per route path, whatever the method
    Route,
    /// A single quota shared by every request
    Global,
}

impl KeyStrategy {
    /// Key for `request` under this strategy.
    pub fn key(self, request: &RequestInfo) -> String {
        match self {
            KeyStrategy::ClientAddr => client_addr_key(request),
            KeyStrategy::User => match &request.user_id {
                Some(user) => format!("user:{}", user),
                None => client_addr_key(request),
            },
            KeyStrategy::Route => format!("route:{}", request.path),
            KeyStrategy::Global => "global".to_string(),
        }
    }

    /// This strategy as a shareable generator.
    pub fn generator(self) -> KeyGenerator {
        Arc::new(move |request| self.key(request))
    }
}

fn client_addr_key(request: &RequestInfo) -> String {
    match request.client_addr {
        Some(addr) => format!("ip:{}", addr),
        None => "ip:unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestInfo {
        RequestInfo::new("POST", "/v1/login").with_client_addr("10.1.2.3".parse().unwrap())
    }

    #[test]
    fn test_client_addr_key() {
        assert_eq!(KeyStrategy::ClientAddr.key(&request()), "ip:10.1.2.3");
        assert_eq!(
            KeyStrategy::ClientAddr.key(&RequestInfo::new("GET", "/")),
            "ip:unknown"
        );
    }

    #[test]
    fn test_user_key_falls_back_to_client_addr() {
        assert_eq!(KeyStrategy::User.key(&request().with_user("alice")), "user:alice");
        assert_eq!(KeyStrategy::User.key(&request()), "ip:10.1.2.3");
    }

    #[test]
    fn test_route_and_global_keys() {
        assert_eq!(KeyStrategy::Route.key(&request()), "route:/v1/login");
        assert_eq!(
            KeyStrategy::Route.key(&RequestInfo {
                path: "/health".to_string(),
                ..RequestInfo::default()
            }),
            "route:/health"
        );
        assert_eq!(KeyStrategy::Global.key(&request()), "global");
    }

    #[test]
    fn test_route_key_ignores_method() {
        let get = RequestInfo::new("GET", "/v1/login");
        assert_eq!(KeyStrategy::Route.key(&get), KeyStrategy::Route.key(&request()));
    }

    #[test]
    fn test_generator_matches_key() {
        let generator = KeyStrategy::User.generator();
        assert_eq!(generator(&request().with_user("bob")), "user:bob");
    }

    #[test]
    fn test_strategy_deserializes_snake_case() {
        let strategy: KeyStrategy = serde_yaml::from_str("client_addr").unwrap();
        assert_eq!(strategy, KeyStrategy::ClientAddr);
    }
}
