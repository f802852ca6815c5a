use async_trait::async_trait;

use crate::{
    circuit_breaker::CircuitBreaker,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
};

/// Last stage before the proxy. Gateway-internal routes never touch a breaker.
pub struct CircuitAdmissionMiddleware {
    breaker: CircuitBreaker,
}

impl CircuitAdmissionMiddleware {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl GatewayMiddleware for CircuitAdmissionMiddleware {
    fn name(&self) -> &'static str {
        "circuit-admission"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let Some(backend) = ctx.backend() else {
            return Ok(ControlFlow::Continue);
        };

        if self.breaker.allow_request(backend).await {
            Ok(ControlFlow::Continue)
        } else {
            Err(GatewayError::CircuitOpen {
                service: backend.to_string(),
            })
        }
    }
}
