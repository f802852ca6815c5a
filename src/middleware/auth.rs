use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    auth::Authenticator,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::Tier,
    router::AuthRequirement,
};

/// Authenticates routes that require it. Public routes pass through untouched,
/// even when a token is presented.
pub struct AuthMiddleware {
    authenticator: Arc<Authenticator>,
}

impl AuthMiddleware {
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl GatewayMiddleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "authentication"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let requirement = ctx
            .route
            .as_ref()
            .map(|r| r.auth)
            .ok_or_else(|| GatewayError::Internal("authentication ran before routing".to_string()))?;
        if requirement == AuthRequirement::None {
            return Ok(ControlFlow::Continue);
        }

        let header = ctx
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let user = self.authenticator.authenticate(header).await?;

        if requirement == AuthRequirement::Admin && user.tier != Tier::Admin {
            tracing::info!(
                correlation_id = %ctx.correlation_id,
                user_id = %user.user_id,
                tier = %user.tier,
                "admin route denied"
            );
            return Err(GatewayError::Forbidden);
        }

        ctx.tier = user.tier;
        ctx.user = Some(user);
        Ok(ControlFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http::{HeaderMap, HeaderValue, Method};

    use super::*;
    use crate::{
        auth::{AuthenticatedUser, TokenVerifier, VerifyError},
        middleware::test_support::ctx,
        router::{RouteMatch, RouteTarget},
    };

    struct Fixed(Tier);

    #[async_trait]
    impl TokenVerifier for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn verify(&self, token: &str) -> Result<AuthenticatedUser, VerifyError> {
            if token == "good" {
                Ok(AuthenticatedUser {
                    user_id: "u-1".to_string(),
                    tier: self.0,
                })
            } else {
                Err(VerifyError::Rejected)
            }
        }
    }

    fn stage(tier: Tier) -> AuthMiddleware {
        AuthMiddleware::new(Arc::new(Authenticator::new(None, Arc::new(Fixed(tier)))))
    }

    fn routed(auth: AuthRequirement, token: Option<&'static str>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert("authorization", HeaderValue::from_static(token));
        }
        let mut ctx = ctx(Method::GET, "/api/cart/items", headers);
        ctx.route = Some(RouteMatch {
            pattern: "/api/cart/*".to_string(),
            target: RouteTarget::Backend("cart".to_string()),
            target_url: None,
            auth,
        });
        ctx
    }

    #[tokio::test]
    async fn public_routes_skip_authentication() {
        let mut ctx = routed(AuthRequirement::None, Some("Bearer good"));
        assert!(matches!(stage(Tier::Premium).on_request(&mut ctx).await, Ok(ControlFlow::Continue)));
        assert!(ctx.user.is_none());
        assert_eq!(ctx.tier, Tier::Public);
    }

    #[tokio::test]
    async fn protected_routes_inject_identity() {
        let mut ctx = routed(AuthRequirement::Required, Some("Bearer good"));
        assert!(matches!(stage(Tier::Premium).on_request(&mut ctx).await, Ok(ControlFlow::Continue)));
        assert_eq!(ctx.user_id(), Some("u-1"));
        assert_eq!(ctx.tier, Tier::Premium);

        let mut ctx = routed(AuthRequirement::Required, None);
        let err = stage(Tier::Premium).on_request(&mut ctx).await.err().unwrap();
        assert_eq!(err.code(), "AUTHENTICATION_REQUIRED");
    }

    #[tokio::test]
    async fn admin_routes_require_admin_tier() {
        let mut ctx = routed(AuthRequirement::Admin, Some("Bearer good"));
        let err = stage(Tier::Authenticated).on_request(&mut ctx).await.err().unwrap();
        assert_eq!(err.code(), "FORBIDDEN");

        let mut ctx = routed(AuthRequirement::Admin, Some("Bearer good"));
        assert!(stage(Tier::Admin).on_request(&mut ctx).await.is_ok());
    }
}
