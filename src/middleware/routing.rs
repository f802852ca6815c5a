use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
    router::RouteTable,
};

pub struct RoutingMiddleware {
    table: Arc<RouteTable>,
}

impl RoutingMiddleware {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl GatewayMiddleware for RoutingMiddleware {
    fn name(&self) -> &'static str {
        "routing"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let matched = self.table.resolve(&ctx.method, ctx.uri.path())?;
        ctx.route = Some(matched);
        Ok(ControlFlow::Continue)
    }
}
