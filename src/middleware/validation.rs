use async_trait::async_trait;

use crate::{
    config::ValidationConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
};

pub struct RequestValidationMiddleware {
    cfg: ValidationConfig,
}

impl RequestValidationMiddleware {
    pub fn new(cfg: ValidationConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl GatewayMiddleware for RequestValidationMiddleware {
    fn name(&self) -> &'static str {
        "request-validation"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if ctx.headers.len() > self.cfg.max_headers {
            return Err(GatewayError::InvalidRequest(format!(
                "Too many headers: {} > {}",
                ctx.headers.len(),
                self.cfg.max_headers
            )));
        }

        if let Some(raw) = ctx.headers.get(http::header::CONTENT_LENGTH) {
            let declared = raw
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| GatewayError::InvalidRequest("Malformed Content-Length header".to_string()))?;
            if declared > self.cfg.max_body_bytes {
                return Err(GatewayError::InvalidRequest(format!(
                    "Request body exceeds {} bytes",
                    self.cfg.max_body_bytes
                )));
            }
        }

        if !ctx.path().starts_with('/') || ctx.path().contains("/../") || ctx.path().ends_with("/..") {
            return Err(GatewayError::InvalidRequest("Malformed request path".to_string()));
        }

        Ok(ControlFlow::Continue)
    }
}
