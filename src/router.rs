use anyhow::{Result, anyhow, bail};
use http::Method;
use serde::Serialize;
use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap},
};

use crate::{
    config::BackendConfig,
    error::{GatewayError, GatewayResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthRequirement {
    None,
    Required,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalEndpoint {
    Health,
    Ready,
    Services,
    Routes,
    Metrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum RouteTarget {
    Backend(String),
    Internal(InternalEndpoint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathPattern {
    Exact(String),
    Prefix(String),
    Wildcard,
}

impl PathPattern {
    fn parse(raw: &str) -> Result<Self> {
        if raw == "*" || raw == "/*" {
            return Ok(Self::Wildcard);
        }
        if !raw.starts_with('/') {
            bail!("route pattern must start with '/': {raw}");
        }
        match raw.strip_suffix("/*") {
            Some(prefix) if !prefix.contains('*') => Ok(Self::Prefix(prefix.to_string())),
            Some(_) => bail!("wildcard is only allowed as the last segment: {raw}"),
            None if raw.contains('*') => bail!("wildcard is only allowed as the last segment: {raw}"),
            None => Ok(Self::Exact(raw.to_string())),
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => path == exact,
            Self::Prefix(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            Self::Wildcard => true,
        }
    }

    /// Lower sorts first: exact, then longer prefixes, then the catch-all.
    fn specificity(&self) -> (u8, Reverse<usize>) {
        match self {
            Self::Exact(p) => (0, Reverse(p.len())),
            Self::Prefix(p) => (1, Reverse(p.len())),
            Self::Wildcard => (2, Reverse(0)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteRule {
    pub path_pattern: String,
    pub methods: BTreeSet<String>,
    pub target: RouteTarget,
    pub target_port: Option<u16>,
    pub auth: AuthRequirement,
    #[serde(skip)]
    pattern: PathPattern,
}

impl RouteRule {
    pub fn new(
        path_pattern: &str,
        methods: &[&str],
        target: RouteTarget,
        auth: AuthRequirement,
    ) -> Result<Self> {
        if methods.is_empty() {
            bail!("route {path_pattern} allows no methods");
        }
        let methods = methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.as_bytes())
                    .map(|m| m.as_str().to_ascii_uppercase())
                    .map_err(|_| anyhow!("route {path_pattern} has invalid method {m}"))
            })
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(Self {
            pattern: PathPattern::parse(path_pattern)?,
            path_pattern: path_pattern.to_string(),
            methods,
            target,
            target_port: None,
            auth,
        })
    }

    fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub pattern: String,
    pub target: RouteTarget,
    /// Full upstream URL for backend routes, without the query string.
    pub target_url: Option<String>,
    pub auth: AuthRequirement,
}

impl RouteMatch {
    pub fn backend(&self) -> Option<&str> {
        match &self.target {
            RouteTarget::Backend(name) => Some(name.as_str()),
            RouteTarget::Internal(_) => None,
        }
    }
}

/// Static routing table, ordered by specificity at construction and read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    backend_urls: HashMap<String, String>,
}

const ALL_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

impl RouteTable {
    pub fn new(mut rules: Vec<RouteRule>, backends: &[BackendConfig]) -> Result<Self> {
        let backend_urls = backends
            .iter()
            .map(|b| (b.name.clone(), b.base_url.clone()))
            .collect::<HashMap<_, _>>();

        if rules.is_empty() {
            bail!("route table is empty");
        }

        for rule in &mut rules {
            if let RouteTarget::Backend(name) = &rule.target {
                let base = backend_urls.get(name).ok_or_else(|| {
                    anyhow!("route {} targets unknown backend {name}", rule.path_pattern)
                })?;
                rule.target_port = reqwest::Url::parse(base)
                    .ok()
                    .and_then(|u| u.port_or_known_default());
            }
        }

        for (idx, rule) in rules.iter().enumerate() {
            let duplicate = rules[..idx].iter().any(|other| {
                other.pattern == rule.pattern && !other.methods.is_disjoint(&rule.methods)
            });
            if duplicate {
                bail!("route {} is defined twice for the same method", rule.path_pattern);
            }
        }

        rules.sort_by_key(|rule| rule.pattern.specificity());
        Ok(Self {
            rules,
            backend_urls,
        })
    }

    /// The storefront routing table.
    pub fn storefront(backends: &[BackendConfig]) -> Result<Self> {
        use AuthRequirement as Auth;
        use InternalEndpoint as Internal;

        let backend = |pattern: &str, methods: &[&str], name: &str, auth: Auth| {
            RouteRule::new(pattern, methods, RouteTarget::Backend(name.to_string()), auth)
        };
        let internal = |pattern: &str, endpoint: Internal, auth: Auth| {
            RouteRule::new(pattern, &["GET"], RouteTarget::Internal(endpoint), auth)
        };

        let rules = vec![
            backend("/api/auth/*", ALL_METHODS, "auth", Auth::None)?,
            backend("/api/profile/*", ALL_METHODS, "profile", Auth::Required)?,
            backend("/api/products/*", &["GET"], "product", Auth::None)?,
            backend("/api/cart/*", ALL_METHODS, "cart", Auth::Required)?,
            backend("/api/orders/*", ALL_METHODS, "order", Auth::Required)?,
            backend("/api/payments/*", ALL_METHODS, "payment", Auth::Required)?,
            backend("/api/notifications/*", ALL_METHODS, "notification", Auth::Required)?,
            internal("/gateway/health", Internal::Health, Auth::None)?,
            internal("/gateway/ready", Internal::Ready, Auth::None)?,
            internal("/gateway/services", Internal::Services, Auth::Admin)?,
            internal("/gateway/routes", Internal::Routes, Auth::Admin)?,
            internal("/gateway/metrics", Internal::Metrics, Auth::Admin)?,
        ];

        Self::new(rules, backends)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Pure lookup: the same method and path always produce the same result.
    pub fn resolve(&self, method: &Method, path: &str) -> GatewayResult<RouteMatch> {
        let mut allowed = BTreeSet::new();

        for rule in self.rules.iter().filter(|r| r.pattern.matches(path)) {
            if rule.allows(method) {
                let target_url = match &rule.target {
                    RouteTarget::Backend(name) => self
                        .backend_urls
                        .get(name)
                        .map(|base| format!("{base}{path}")),
                    RouteTarget::Internal(_) => None,
                };
                return Ok(RouteMatch {
                    pattern: rule.path_pattern.clone(),
                    target: rule.target.clone(),
                    target_url,
                    auth: rule.auth,
                });
            }
            allowed.extend(rule.methods.iter().cloned());
        }

        if allowed.is_empty() {
            Err(GatewayError::RouteNotFound)
        } else {
            Err(GatewayError::MethodNotAllowed {
                allowed: allowed.into_iter().collect(),
            })
        }
    }
}
