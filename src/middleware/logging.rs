use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
};

pub struct RequestLoggingMiddleware;

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            method = %ctx.method,
            path = %ctx.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut axum::response::Response,
    ) -> GatewayResult<()> {
        let latency_ms = ctx.started_at.elapsed().as_millis() as u64;
        tracing::info!(
            correlation_id = %ctx.correlation_id,
            method = %ctx.method,
            path = %ctx.path(),
            route = ctx.route.as_ref().map(|r| r.pattern.as_str()),
            backend = ctx.backend(),
            user_id = ctx.user_id(),
            tier = %ctx.tier,
            status = response.status().as_u16(),
            latency_ms,
            "request completed"
        );
        Ok(())
    }
}
