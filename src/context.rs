use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    net::IpAddr,
    time::Instant,
};

use crate::{
    auth::AuthenticatedUser,
    ratelimit::{RateLimitDecision, RateLimitKey, Tier},
    router::RouteMatch,
};

/// Per-request state threaded through the pipeline stages. Never shared
/// between requests.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    pub route: Option<RouteMatch>,
    pub user: Option<AuthenticatedUser>,
    pub tier: Tier,
    pub rate_limit_key: Option<RateLimitKey>,
    pub rate_limit: Option<RateLimitDecision>,
}

impl RequestContext {
    pub fn new(
        correlation_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            correlation_id,
            method,
            uri,
            headers,
            body,
            client_ip,
            started_at: Instant::now(),
            route: None,
            user: None,
            tier: Tier::Public,
            rate_limit_key: None,
            rate_limit: None,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.user_id.as_str())
    }

    pub fn backend(&self) -> Option<&str> {
        self.route.as_ref().and_then(|r| r.backend())
    }
}
