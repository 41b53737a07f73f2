use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::error::AppError;

/// Process-wide limiter shared by every route it is layered onto
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitLayer {
    /// A zero budget is treated as one request per minute
    pub fn per_minute(requests: u32) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(burst))),
        }
    }

    pub fn check(&self) -> Result<(), AppError> {
        self.limiter.check().map_err(|_| AppError::RateLimited)
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitLayer>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Err(e) = limiter.check() {
        warn!("Rate limit hit on {}", req.uri().path());
        return Err(e);
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_rejects() {
        let limiter = RateLimitLayer::per_minute(3);
        for _ in 0..3 {
            assert!(limiter.check().is_ok());
        }
        assert!(matches!(limiter.check(), Err(AppError::RateLimited)));
    }

    #[test]
    fn test_clones_share_budget() {
        let limiter = RateLimitLayer::per_minute(1);
        let other = limiter.clone();
        assert!(limiter.check().is_ok());
        assert!(other.check().is_err());
    }
}
