//! Routes and per-route policies, driven in-process through `oneshot`.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use beacon_core::{RequiredMethods, RoutePolicy, ServiceInstance};
use beacon_server::config::RoutePolicies;
use beacon_server::gate::AuthGate;
use beacon_server::routes::{AppState, router};
use beacon_server::tls::{ListenerStatus, TlsInfo};
use serde_json::Value;
use tower::ServiceExt;
use url::Url;

fn app_with(policies: &RoutePolicies, context_path: &str, accepting: bool) -> Router {
    let listener = ListenerStatus::new();
    if accepting {
        listener.mark_accepting();
    }
    let state = AppState::new("counter-app", "testing", listener, common::idle_lifecycle(), None);
    router(state, AuthGate::new(Arc::new(common::StubVerifier)), policies, context_path)
}

fn app() -> Router {
    app_with(&RoutePolicies::default(), "", true)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn with_cert(mut req: Request<Body>) -> Request<Body> {
    req.extensions_mut().insert(TlsInfo::with_peer(common::CLIENT_CN));
    req
}

fn with_token(mut req: Request<Body>, token: &str) -> Request<Body> {
    req.headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
    req
}

async fn json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_open_and_reports_listener() {
    let response = app().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-service-name"], "counter-app");

    let body = json(response).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["serviceId"], "counter-app");
    assert_eq!(body["registration"], "UNREGISTERED");
    assert!(body["instanceId"].as_str().unwrap().starts_with("counter-app:"));
    assert!(body["uptime"].as_str().unwrap().ends_with('s'));
    for field in ["cpu", "memory", "responseTime"] {
        assert!(body["metrics"][field].is_number(), "missing metrics.{field}");
    }
}

#[tokio::test]
async fn health_is_503_when_listener_stopped() {
    let response = app_with(&RoutePolicies::default(), "", false)
        .oneshot(get("/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json(response).await["status"], "DOWN");
}

#[tokio::test]
async fn count_without_credentials_is_401() {
    let response = app().oneshot(get("/api/v1/count")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    assert_eq!(response.headers()["x-service-name"], "counter-app");
    assert_eq!(json(response).await["error"], "unauthorized");
}

#[tokio::test]
async fn count_accepts_either_proof() {
    let by_cert = app().oneshot(with_cert(get("/api/v1/count"))).await.unwrap();
    assert_eq!(by_cert.status(), StatusCode::OK);
    let body = json(by_cert).await;
    assert_eq!(body["auth_type"], "CERTIFICATE");
    assert_eq!(body["caller"], format!("cn={}", common::CLIENT_CN));

    let by_token = app().oneshot(with_token(get("/api/v1/count"), "good")).await.unwrap();
    assert_eq!(by_token.status(), StatusCode::OK);
    assert_eq!(json(by_token).await["auth_type"], "TOKEN");

    let both = app()
        .oneshot(with_token(with_cert(get("/api/v1/count")), "good"))
        .await
        .unwrap();
    assert_eq!(json(both).await["auth_type"], "CERTIFICATE+TOKEN");
}

#[tokio::test]
async fn protected_requires_scoped_token() {
    let cert_only = app().oneshot(with_cert(get("/api/v1/count/protected"))).await.unwrap();
    assert_eq!(cert_only.status(), StatusCode::UNAUTHORIZED);

    let scoped = app()
        .oneshot(with_token(get("/api/v1/count/protected"), "good"))
        .await
        .unwrap();
    assert_eq!(scoped.status(), StatusCode::OK);
}

#[tokio::test]
async fn bad_signature_and_missing_scope_look_the_same() {
    let forged = app()
        .oneshot(with_token(get("/api/v1/count/protected"), "forged"))
        .await
        .unwrap();
    let unscoped = app()
        .oneshot(with_token(get("/api/v1/count/protected"), "noscope"))
        .await
        .unwrap();

    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(unscoped.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(forged).await, json(unscoped).await);
}

#[tokio::test]
async fn certificate_only_policy_rejects_token() {
    let policies = RoutePolicies {
        count: RoutePolicy::new(RequiredMethods::CertificateOnly),
        ..RoutePolicies::default()
    };
    let app = app_with(&policies, "", true);

    let by_token = app
        .clone()
        .oneshot(with_token(get("/api/v1/count"), "good"))
        .await
        .unwrap();
    assert_eq!(by_token.status(), StatusCode::UNAUTHORIZED);

    let by_cert = app.oneshot(with_cert(get("/api/v1/count"))).await.unwrap();
    assert_eq!(by_cert.status(), StatusCode::OK);
}

#[tokio::test]
async fn open_policy_admits_anonymous_callers() {
    let policies = RoutePolicies {
        details: RoutePolicy::open(),
        ..RoutePolicies::default()
    };
    let response = app_with(&policies, "", true)
        .oneshot(get("/api/v1/count/details"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["status"], "success");
}

#[tokio::test]
async fn increment_and_reset_share_one_counter() {
    let app = app();
    for expected in 1..=2 {
        let response = app
            .clone()
            .oneshot(with_cert(get("/api/v1/count/increment")))
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["count"], expected);
        assert_eq!(body["status"], "incremented");
    }

    let reset = json(app.oneshot(with_cert(get("/api/v1/count/reset"))).await.unwrap()).await;
    assert_eq!(reset["count"], 0);
    assert_eq!(reset["status"], "reset");
}

#[tokio::test]
async fn context_path_prefixes_every_route() {
    let app = app_with(&RoutePolicies::default(), "/r/counter-app", true);

    let health = app.clone().oneshot(get("/r/counter-app/health")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let unprefixed = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(unprefixed.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn advertised_status_page_is_served_under_context_path() {
    let instance = ServiceInstance::new(
        "counter-app",
        "localhost",
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        5001,
        "/r/counter-app",
    );
    let app = app_with(&RoutePolicies::default(), "/r/counter-app", true);

    for advertised in [&instance.status_page_url, &instance.health_check_url] {
        let path = Url::parse(advertised).unwrap().path().to_string();
        let response = app.clone().oneshot(get(&path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn openapi_document_lists_counter_routes() {
    let response = app().oneshot(get("/api-docs/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc = json(response).await;
    assert!(doc["paths"]["/api/v1/count/protected"].is_object());
    assert!(doc["components"]["securitySchemes"]["api_jwt"].is_object());
}

#[tokio::test]
async fn swagger_ui_is_served_under_context_path() {
    let app = app_with(&RoutePolicies::default(), "/r/counter-app", true);

    let ui = app.clone().oneshot(get("/r/counter-app/swagger-ui/")).await.unwrap();
    assert_eq!(ui.status(), StatusCode::OK);

    let doc = app.oneshot(get("/r/counter-app/api-docs/openapi.json")).await.unwrap();
    assert_eq!(doc.status(), StatusCode::OK);
}

#[tokio::test]
async fn home_is_open() {
    let response = app().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["message"], "counter-app API");
}
