use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    admin::Introspection,
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
    router::RouteTarget,
};

/// Answers `/gateway/*` routes once auth and rate limiting have passed.
pub struct InternalEndpointMiddleware {
    admin: Arc<Introspection>,
}

impl InternalEndpointMiddleware {
    pub fn new(admin: Arc<Introspection>) -> Self {
        Self { admin }
    }
}

#[async_trait]
impl GatewayMiddleware for InternalEndpointMiddleware {
    fn name(&self) -> &'static str {
        "internal-endpoints"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        match ctx.route.as_ref().map(|r| &r.target) {
            Some(RouteTarget::Internal(endpoint)) => {
                Ok(ControlFlow::Respond(self.admin.respond(*endpoint).await))
            }
            _ => Ok(ControlFlow::Continue),
        }
    }
}
