//! Request authorization pipeline.
//!
//! A request walks an ordered list of stages, cheapest first:
//!
//! ```text
//! PublicBypass → Authenticate → NegativeCheck → ClaimMatch → CoalescedBackendCheck
//! ```
//!
//! Each stage either decides (allow or deny) or passes the request on. Only
//! `Authenticate` (on a cache miss) and `CoalescedBackendCheck` leave the
//! process. Every uncertainty resolves to deny.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use authedge_cache::{Coalescer, FilterVerdict, PermissionFilter, TokenCache};
use authedge_core::{
    Action, AuthError, AuthorityError, IdentityAuthority, PermissionKey, UserContext,
};

use crate::metrics;

/// What the pipeline needs to know about an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct AuthzRequest<'a> {
    pub path: &'a str,
    pub action: Action,
    pub bearer: Option<&'a str>,
}

impl<'a> AuthzRequest<'a> {
    pub fn new(method: &str, path: &'a str, bearer: Option<&'a str>) -> Self {
        Self {
            path,
            action: Action::from_method(method),
            bearer,
        }
    }
}

/// Why a request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    PublicPath,
    ClaimMatch,
    Authority,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Allow {
        /// `None` for public paths.
        identity: Option<Arc<UserContext>>,
        reason: AllowReason,
    },
    Deny {
        error: AuthError,
        stage: &'static str,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// Per-request state threaded through the stages.
pub struct Evaluation<'a> {
    pub request: AuthzRequest<'a>,
    pub identity: Option<Arc<UserContext>>,
}

pub enum StageOutcome {
    Continue,
    Allow(AllowReason),
    Deny(AuthError),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, eval: &mut Evaluation<'_>) -> StageOutcome;
}

/// Ordered stage list.
pub struct AuthorizationPipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl AuthorizationPipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn decide(&self, request: AuthzRequest<'_>) -> Decision {
        let started = Instant::now();
        let mut eval = Evaluation {
            request,
            identity: None,
        };

        let mut decision = None;
        for stage in &self.stages {
            match stage.evaluate(&mut eval).await {
                StageOutcome::Continue => continue,
                StageOutcome::Allow(reason) => {
                    metrics::record_decision("allow", stage.name(), started.elapsed());
                    decision = Some(Decision::Allow {
                        identity: eval.identity.take(),
                        reason,
                    });
                }
                StageOutcome::Deny(error) => {
                    metrics::record_decision("deny", stage.name(), started.elapsed());
                    tracing::debug!(
                        stage = stage.name(),
                        path = request.path,
                        action = %request.action,
                        error = %error,
                        "request denied"
                    );
                    decision = Some(Decision::Deny {
                        error,
                        stage: stage.name(),
                    });
                }
            }
            break;
        }

        decision.unwrap_or_else(|| {
            metrics::record_decision("deny", "exhausted", started.elapsed());
            Decision::Deny {
                error: AuthError::forbidden("no stage granted access"),
                stage: "exhausted",
            }
        })
    }
}

// =============================================================================
// Stages
// =============================================================================

/// Allows configured path prefixes without authentication.
pub struct PublicBypass {
    prefixes: Vec<String>,
}

impl PublicBypass {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

#[async_trait]
impl Stage for PublicBypass {
    fn name(&self) -> &'static str {
        "public_bypass"
    }

    async fn evaluate(&self, eval: &mut Evaluation<'_>) -> StageOutcome {
        let path = eval.request.path;
        if self.prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            StageOutcome::Allow(AllowReason::PublicPath)
        } else {
            StageOutcome::Continue
        }
    }
}

/// Resolves the bearer token to a user context through the token cache.
pub struct Authenticate {
    cache: TokenCache,
    authority: Arc<dyn IdentityAuthority>,
}

impl Authenticate {
    pub fn new(cache: TokenCache, authority: Arc<dyn IdentityAuthority>) -> Self {
        Self { cache, authority }
    }
}

#[async_trait]
impl Stage for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn evaluate(&self, eval: &mut Evaluation<'_>) -> StageOutcome {
        let Some(token) = eval.request.bearer else {
            return StageOutcome::Deny(AuthError::unauthorized("missing bearer token"));
        };

        let authority = self.authority.clone();
        let owned = token.to_string();
        let loaded = self
            .cache
            .get_or_load(token, move || async move { authority.validate_token(&owned).await })
            .await;

        match loaded {
            Ok(ctx) if ctx.is_expired() => StageOutcome::Deny(AuthError::TokenExpired),
            Ok(ctx) => {
                eval.identity = Some(ctx);
                StageOutcome::Continue
            }
            Err(AuthorityError::InvalidToken(message)) => {
                StageOutcome::Deny(AuthError::invalid_token(message))
            }
            Err(e) => {
                tracing::warn!(error = %e, "token validation failed, denying");
                StageOutcome::Deny(e.into())
            }
        }
    }
}

/// Denies outright when the permission filter is sure nothing grants access.
pub struct NegativeCheck {
    filter: Arc<PermissionFilter>,
}

impl NegativeCheck {
    pub fn new(filter: Arc<PermissionFilter>) -> Self {
        Self { filter }
    }
}

#[async_trait]
impl Stage for NegativeCheck {
    fn name(&self) -> &'static str {
        "negative_check"
    }

    async fn evaluate(&self, eval: &mut Evaluation<'_>) -> StageOutcome {
        let Some(ctx) = eval.identity.as_deref() else {
            return StageOutcome::Continue;
        };
        let verdict = self.filter.might_match(
            &ctx.tenant_id,
            &ctx.user_id,
            eval.request.path,
            eval.request.action,
        );
        match verdict {
            FilterVerdict::Absent => {
                metrics::record_filter_shortcut();
                StageOutcome::Deny(AuthError::forbidden("permission not granted"))
            }
            FilterVerdict::MaybePresent | FilterVerdict::Indeterminate => StageOutcome::Continue,
        }
    }
}

/// Allows when a permission pattern carried by the user context matches.
pub struct ClaimMatch;

#[async_trait]
impl Stage for ClaimMatch {
    fn name(&self) -> &'static str {
        "claim_match"
    }

    async fn evaluate(&self, eval: &mut Evaluation<'_>) -> StageOutcome {
        let granted = eval
            .identity
            .as_deref()
            .and_then(|ctx| ctx.matching_grant(eval.request.path, eval.request.action))
            .is_some();
        if granted {
            StageOutcome::Allow(AllowReason::ClaimMatch)
        } else {
            StageOutcome::Continue
        }
    }
}

/// Asks the authority, sharing one in-flight call per permission key.
///
/// The call is bounded by `timeout`; a timeout or an authority error denies.
/// The answer is not written back into the filter.
pub struct CoalescedBackendCheck {
    authority: Arc<dyn IdentityAuthority>,
    checks: Arc<Coalescer<bool, AuthorityError>>,
    timeout: Duration,
}

impl CoalescedBackendCheck {
    pub fn new(
        authority: Arc<dyn IdentityAuthority>,
        checks: Arc<Coalescer<bool, AuthorityError>>,
        timeout: Duration,
    ) -> Self {
        Self {
            authority,
            checks,
            timeout,
        }
    }
}

#[async_trait]
impl Stage for CoalescedBackendCheck {
    fn name(&self) -> &'static str {
        "backend_check"
    }

    async fn evaluate(&self, eval: &mut Evaluation<'_>) -> StageOutcome {
        let Some(ctx) = eval.identity.as_deref() else {
            return StageOutcome::Deny(AuthError::unauthorized("request is not authenticated"));
        };
        let key = PermissionKey::for_request(ctx, eval.request.path, eval.request.action);

        let authority = self.authority.clone();
        let coalescing_key = key.coalescing_key();
        let check = self.checks.coalesce(coalescing_key, move || async move {
            authority
                .check_permission(&key.user_id, &key.tenant_id, &key.resource, key.action)
                .await
        });

        match tokio::time::timeout(self.timeout, check).await {
            Ok(Ok(true)) => StageOutcome::Allow(AllowReason::Authority),
            Ok(Ok(false)) => StageOutcome::Deny(AuthError::forbidden("permission denied")),
            Ok(Err(e)) => {
                tracing::warn!(
                    error = %e,
                    user_id = %ctx.user_id,
                    path = eval.request.path,
                    "permission check failed, failing closed"
                );
                StageOutcome::Deny(AuthError::upstream_timeout(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    user_id = %ctx.user_id,
                    path = eval.request.path,
                    "permission check timed out, failing closed"
                );
                StageOutcome::Deny(AuthError::upstream_timeout(format!(
                    "no answer within {:?}",
                    self.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authedge_cache::{AdaptiveTtlController, FilterConfig, TokenCacheConfig};
    use authedge_core::InMemoryAuthority;
    use time::OffsetDateTime;

    struct Fixture {
        authority: Arc<InMemoryAuthority>,
        filter: Arc<PermissionFilter>,
        pipeline: AuthorizationPipeline,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let authority = Arc::new(InMemoryAuthority::new());
        let dyn_authority: Arc<dyn IdentityAuthority> = authority.clone();
        let cache = TokenCache::new(
            TokenCacheConfig::default(),
            Arc::new(AdaptiveTtlController::new(Default::default())),
            Arc::new(Coalescer::default()),
        );
        let filter = Arc::new(PermissionFilter::new(
            FilterConfig {
                expected_insertions: 1_000,
                false_positive_rate: 0.001,
                ..FilterConfig::default()
            },
            "gw-test",
        ));

        let pipeline = AuthorizationPipeline::new(vec![
            Box::new(PublicBypass::new(vec!["/api/v1/auth/login".into()])),
            Box::new(Authenticate::new(cache, dyn_authority.clone())),
            Box::new(NegativeCheck::new(filter.clone())),
            Box::new(ClaimMatch),
            Box::new(CoalescedBackendCheck::new(
                dyn_authority,
                Arc::new(Coalescer::default()),
                timeout,
            )),
        ]);

        authority.register_token(
            "tok-sales",
            UserContext::new("u1", "t1", OffsetDateTime::now_utc() + time::Duration::hours(1))
                .with_permission("/api/customers/**", [Action::Read, Action::Create]),
        );

        Fixture {
            authority,
            filter,
            pipeline,
        }
    }

    fn denied_with(decision: &Decision) -> (&AuthError, &'static str) {
        match decision {
            Decision::Deny { error, stage } => (error, *stage),
            Decision::Allow { .. } => panic!("expected a denial, got {decision:?}"),
        }
    }

    #[tokio::test]
    async fn test_stage_order() {
        let f = fixture(Duration::from_millis(25));
        assert_eq!(
            f.pipeline.stage_names(),
            vec![
                "public_bypass",
                "authenticate",
                "negative_check",
                "claim_match",
                "backend_check"
            ]
        );
    }

    #[tokio::test]
    async fn test_public_path_needs_no_token() {
        let f = fixture(Duration::from_millis(25));
        let decision = f
            .pipeline
            .decide(AuthzRequest::new("POST", "/api/v1/auth/login", None))
            .await;
        assert!(matches!(
            decision,
            Decision::Allow {
                identity: None,
                reason: AllowReason::PublicPath
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_and_unknown_tokens_are_unauthenticated() {
        let f = fixture(Duration::from_millis(25));

        let decision = f.pipeline.decide(AuthzRequest::new("GET", "/api/x", None)).await;
        let (error, stage) = denied_with(&decision);
        assert!(error.is_authentication_error());
        assert_eq!(stage, "authenticate");

        let decision = f
            .pipeline
            .decide(AuthzRequest::new("GET", "/api/x", Some("forged")))
            .await;
        assert_eq!(denied_with(&decision).0.error_code(), "invalid_token");
    }

    #[tokio::test]
    async fn test_claim_match_allows_without_backend() {
        let f = fixture(Duration::from_millis(25));
        let decision = f
            .pipeline
            .decide(AuthzRequest::new("GET", "/api/customers/42", Some("tok-sales")))
            .await;

        match decision {
            Decision::Allow { identity, reason } => {
                assert_eq!(reason, AllowReason::ClaimMatch);
                assert_eq!(identity.map(|c| c.user_id.clone()).as_deref(), Some("u1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.authority.calls().check_permission, 0);
    }

    #[tokio::test]
    async fn test_backend_denial_when_claims_do_not_cover() {
        let f = fixture(Duration::from_millis(250));
        let decision = f
            .pipeline
            .decide(AuthzRequest::new("DELETE", "/api/customers/42", Some("tok-sales")))
            .await;

        let (error, stage) = denied_with(&decision);
        assert_eq!(error.error_code(), "access_denied");
        assert_eq!(stage, "backend_check");
        assert_eq!(f.authority.calls().check_permission, 1);
    }

    #[tokio::test]
    async fn test_backend_grant_allows() {
        let f = fixture(Duration::from_millis(250));
        f.authority.grant(PermissionKey::new(
            "t1",
            "u1",
            "/api/customers/*",
            Action::Delete,
        ));

        let decision = f
            .pipeline
            .decide(AuthzRequest::new("DELETE", "/api/customers/42", Some("tok-sales")))
            .await;
        assert!(matches!(
            decision,
            Decision::Allow {
                reason: AllowReason::Authority,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_slow_authority_fails_closed() {
        let f = fixture(Duration::from_millis(25));
        // Validate the token while the authority is still fast.
        f.pipeline
            .decide(AuthzRequest::new("GET", "/api/customers/1", Some("tok-sales")))
            .await;
        f.authority.set_latency(Duration::from_millis(200));

        let decision = f
            .pipeline
            .decide(AuthzRequest::new("DELETE", "/api/customers/42", Some("tok-sales")))
            .await;
        let (error, _) = denied_with(&decision);
        assert_eq!(error.error_code(), "upstream_timeout");
        assert!(error.is_authorization_error());
    }

    #[tokio::test]
    async fn test_unavailable_authority_fails_closed() {
        let f = fixture(Duration::from_millis(250));
        f.pipeline
            .decide(AuthzRequest::new("GET", "/api/customers/1", Some("tok-sales")))
            .await;
        f.authority.set_unavailable(true);

        let decision = f
            .pipeline
            .decide(AuthzRequest::new("PUT", "/api/customers/42", Some("tok-sales")))
            .await;
        assert_eq!(denied_with(&decision).0.error_code(), "upstream_timeout");
    }

    #[tokio::test]
    async fn test_filter_absent_short_circuits() {
        let f = fixture(Duration::from_millis(250));
        let generation = f.filter.request_rebuild();
        f.filter.rebuild(
            generation,
            [PermissionKey::new("t1", "u1", "/api/customers/**", Action::Read)],
        );

        let decision = f
            .pipeline
            .decide(AuthzRequest::new("DELETE", "/api/customers/42", Some("tok-sales")))
            .await;
        let (error, stage) = denied_with(&decision);
        assert_eq!(error.error_code(), "access_denied");
        assert_eq!(stage, "negative_check");
        assert_eq!(f.authority.calls().check_permission, 0);

        let decision = f
            .pipeline
            .decide(AuthzRequest::new("GET", "/api/customers/42", Some("tok-sales")))
            .await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_expired_context_is_rejected() {
        let f = fixture(Duration::from_millis(25));
        f.authority.register_token(
            "tok-old",
            UserContext::new("u2", "t1", OffsetDateTime::now_utc() - time::Duration::seconds(5)),
        );

        let decision = f
            .pipeline
            .decide(AuthzRequest::new("GET", "/api/customers/42", Some("tok-old")))
            .await;
        assert_eq!(denied_with(&decision).0, &AuthError::TokenExpired);
    }
}
