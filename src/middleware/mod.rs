pub mod auth;
pub mod circuit;
pub mod internal;
pub mod logging;
pub mod rate_limit;
pub mod routing;
pub mod validation;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
};

pub enum ControlFlow {
    Continue,
    Respond(Response<Body>),
}

/// One pipeline stage. An `Err` stops the pipeline and becomes the error
/// envelope; `on_response` runs for every stage that continued, in reverse.
#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
