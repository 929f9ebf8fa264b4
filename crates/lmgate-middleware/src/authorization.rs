use async_trait::async_trait;
use http::header::AUTHORIZATION;
use lmgate_model::{Context, Response, Termination};

use crate::middleware::{Flow, Middleware};

/// Compares the request's `Authorization: Bearer <token>` header against a
/// configured shared secret. Grounded on
/// `middlewares/authorization.py::AuthorizationMiddleware`.
pub struct AuthorizationMiddleware {
    priority: i32,
    token: String,
}

impl AuthorizationMiddleware {
    pub fn new(priority: i32, token: String) -> Self {
        Self { priority, token }
    }
}

#[async_trait]
impl Middleware for AuthorizationMiddleware {
    fn name(&self) -> &str {
        "authorization"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn pre_request(&self, ctx: &mut Context) -> Result<Flow, Termination> {
        let presented = ctx
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or("");

        if presented != self.token {
            return Err(Termination::new(
                Response::error(401, "Unauthorized")
                    .with_header(http::header::WWW_AUTHENTICATE, "Bearer"),
            ));
        }

        Ok(Flow::Continue)
    }
}
