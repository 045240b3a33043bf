//! Per-route authorization over two independent proofs.
//!
//! A request can present a verified client certificate (from the TLS
//! handshake), a bearer token, or both. Each proof is validated on its own
//! and contributes one [`AuthMethod`]; the route's [`RoutePolicy`] then
//! decides over the resulting set. Failures of any kind collapse into the
//! same 401 body.

use std::collections::HashSet;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use beacon_core::{AuthDecision, AuthMethod, Principal, RoutePolicy};
use serde::Serialize;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::tls::TlsInfo;
use crate::token::{TokenRejection, TokenVerifier};

pub const AUTH_DECISIONS_METRIC: &str = "beacon_auth_decisions_total";

/// Validates both proofs for a request and evaluates a route policy.
#[derive(Clone)]
pub struct AuthGate {
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Decide whether a request meets `policy`.
    ///
    /// `bearer` is the raw token with the `Bearer ` prefix already stripped.
    pub async fn authorize(&self, policy: &RoutePolicy, tls: &TlsInfo, bearer: Option<&str>) -> AuthDecision {
        let mut methods = HashSet::new();
        let mut principal = Principal::default();

        if let Some(peer) = &tls.peer {
            methods.insert(AuthMethod::Certificate);
            principal.certificate_cn = peer.common_name.clone();
        }

        if let Some(token) = bearer {
            match self.verifier.verify(token).await {
                Ok(verified) => match policy.check_grants(&verified.grants) {
                    Ok(()) => {
                        methods.insert(AuthMethod::Token);
                        principal.token_subject = verified.subject;
                    }
                    Err(grant_error) => {
                        info!(
                            reason = "grant",
                            subject = verified.subject.as_deref(),
                            error = %grant_error,
                            "token valid but lacks required grant"
                        );
                    }
                },
                Err(rejection) => log_rejection(&rejection),
            }
        }

        AuthDecision::evaluate(policy, principal, methods)
    }
}

fn log_rejection(rejection: &TokenRejection) {
    match rejection {
        TokenRejection::KeySetUnavailable(_) => {
            warn!(reason = rejection.reason(), error = %rejection, "token rejected")
        }
        _ => info!(reason = rejection.reason(), error = %rejection, "token rejected"),
    }
}

/// Extracts the bearer credential from an `Authorization` header.
///
/// The scheme is matched case-insensitively. Anything else, including an
/// empty token, counts as no token.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Middleware state binding one route to its policy.
#[derive(Clone)]
pub struct PolicyGuard {
    pub gate: AuthGate,
    pub policy: Arc<RoutePolicy>,
    pub route: &'static str,
}

impl PolicyGuard {
    pub fn new(gate: AuthGate, policy: RoutePolicy, route: &'static str) -> Self {
        Self {
            gate,
            policy: Arc::new(policy),
            route,
        }
    }
}

/// Route middleware: evaluates the guard's policy and either rejects with
/// 401 or forwards the request with the [`AuthDecision`] attached.
pub async fn enforce(State(guard): State<PolicyGuard>, mut req: Request, next: Next) -> Response {
    let tls = req.extensions().get::<TlsInfo>().cloned().unwrap_or_default();
    let decision = guard
        .gate
        .authorize(&guard.policy, &tls, bearer_token(req.headers()))
        .await;

    let outcome = if decision.allowed { "allowed" } else { "denied" };
    metrics::counter!(AUTH_DECISIONS_METRIC, "route" => guard.route, "outcome" => outcome).increment(1);

    if !decision.allowed {
        info!(
            route = guard.route,
            required = ?guard.policy.required,
            presented = %decision.describe_methods(),
            "request denied"
        );
        return unauthorized("Authentication required");
    }

    debug!(
        route = guard.route,
        principal = %decision.principal,
        methods = %decision.describe_methods(),
        "request authorized"
    );
    req.extensions_mut().insert(decision);
    next.run(req).await
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    #[schema(example = "unauthorized")]
    pub error: String,
    #[schema(example = "Authentication required")]
    pub message: String,
}

/// The only rejection shape the gate ever produces.
pub fn unauthorized(message: &str) -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: "unauthorized".to_string(),
            message: message.to_string(),
        }),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_core::{RequiredMethods, TokenGrants};

    use crate::token::VerifiedToken;

    /// Accepts the token `good` with scope `counter-app.read`, `noscope`
    /// without scopes, and rejects everything else.
    struct StubVerifier;

    #[async_trait]
    impl TokenVerifier for StubVerifier {
        async fn verify(&self, token: &str) -> Result<VerifiedToken, TokenRejection> {
            let scopes = match token {
                "good" => ["counter-app.read".to_string()].into_iter().collect(),
                "noscope" => HashSet::new(),
                _ => return Err(TokenRejection::BadSignature),
            };
            Ok(VerifiedToken {
                subject: Some("user-1".into()),
                issuer: "https://issuer".into(),
                grants: TokenGrants {
                    scopes,
                    ..TokenGrants::default()
                },
            })
        }
    }

    fn gate() -> AuthGate {
        AuthGate::new(Arc::new(StubVerifier))
    }

    #[tokio::test]
    async fn certificate_alone_satisfies_any_of() {
        let decision = gate()
            .authorize(&RoutePolicy::new(RequiredMethods::AnyOf), &TlsInfo::with_peer("client.local"), None)
            .await;
        assert!(decision.allowed);
        assert!(decision.has(AuthMethod::Certificate));
        assert_eq!(decision.principal.certificate_cn.as_deref(), Some("client.local"));
    }

    #[tokio::test]
    async fn token_alone_satisfies_any_of() {
        let decision = gate()
            .authorize(&RoutePolicy::new(RequiredMethods::AnyOf), &TlsInfo::default(), Some("good"))
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.principal.token_subject.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn invalid_token_with_certificate_still_passes_any_of() {
        let decision = gate()
            .authorize(&RoutePolicy::new(RequiredMethods::AnyOf), &TlsInfo::with_peer("client.local"), Some("forged"))
            .await;
        assert!(decision.allowed);
        assert!(!decision.has(AuthMethod::Token));
    }

    #[tokio::test]
    async fn nothing_presented_is_denied() {
        let decision = gate()
            .authorize(&RoutePolicy::new(RequiredMethods::AnyOf), &TlsInfo::default(), None)
            .await;
        assert!(!decision.allowed);
        assert!(decision.principal.is_anonymous());
    }

    #[tokio::test]
    async fn missing_scope_contributes_no_token() {
        let policy = RoutePolicy::new(RequiredMethods::TokenOnly).with_scope("counter-app.read");
        let denied = gate().authorize(&policy, &TlsInfo::default(), Some("noscope")).await;
        assert!(!denied.allowed);

        let allowed = gate().authorize(&policy, &TlsInfo::default(), Some("good")).await;
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn certificate_only_ignores_valid_token_alone() {
        let decision = gate()
            .authorize(&RoutePolicy::new(RequiredMethods::CertificateOnly), &TlsInfo::default(), Some("good"))
            .await;
        assert!(!decision.allowed);
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn unauthorized_shape() {
        let response = unauthorized("Authentication required");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }
}
