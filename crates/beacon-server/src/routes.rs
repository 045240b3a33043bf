use std::sync::Arc;
use std::time::Instant;

use axum::{
    Extension, Json, Router,
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
};
use beacon_core::{AuthDecision, Counter, HealthStatus, LifecycleState, RoutePolicy, time::format_uptime};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Serialize;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::RoutePolicies;
use crate::gate::{AuthGate, ErrorBody, PolicyGuard, enforce};
use crate::lifecycle::RegistrationManager;
use crate::telemetry::{ProcessSampler, ResourceUsage};
use crate::tls::ListenerStatus;

pub const SERVICE_NAME_HEADER: HeaderName = HeaderName::from_static("x-service-name");

#[derive(Clone)]
pub struct AppState {
    pub counter: Arc<Mutex<Counter>>,
    pub listener: ListenerStatus,
    pub lifecycle: Arc<RegistrationManager>,
    pub started_at: Instant,
    pub app_name: String,
    pub environment: String,
    pub metrics: Option<PrometheusHandle>,
    pub process: Arc<ProcessSampler>,
}

impl AppState {
    pub fn new(
        app_name: impl Into<String>,
        environment: impl Into<String>,
        listener: ListenerStatus,
        lifecycle: Arc<RegistrationManager>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            counter: Arc::new(Mutex::new(Counter::new("Main counter"))),
            listener,
            lifecycle,
            started_at: Instant::now(),
            app_name: app_name.into(),
            environment: environment.into(),
            metrics,
            process: Arc::new(ProcessSampler::new()),
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        home,
        health_check,
        get_count,
        increment_count,
        reset_count,
        counter_details,
        protected_count,
    ),
    components(
        schemas(
            HomeInfo,
            HealthResponse,
            ResourceUsage,
            CounterResponse,
            CounterDetails,
            OperationStatus,
            ErrorBody,
            beacon_core::Counter,
            beacon_core::HealthStatus,
            beacon_core::LifecycleState,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_jwt",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            )
        }
    }
}

/// Builds the application router, mounted under `context_path`.
pub fn router(state: AppState, gate: AuthGate, policies: &RoutePolicies, context_path: &str) -> Router {
    let guard = |policy: &RoutePolicy, route: &'static str| {
        middleware::from_fn_with_state(PolicyGuard::new(gate.clone(), policy.clone(), route), enforce)
    };
    let service_name = HeaderValue::from_str(&state.app_name).ok();

    let routes = Router::new()
        .route("/", get(home))
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/api/v1/count", get(get_count).route_layer(guard(&policies.count, "count")))
        .route(
            "/api/v1/count/increment",
            get(increment_count).route_layer(guard(&policies.increment, "increment")),
        )
        .route("/api/v1/count/reset", get(reset_count).route_layer(guard(&policies.reset, "reset")))
        .route(
            "/api/v1/count/details",
            get(counter_details).route_layer(guard(&policies.details, "details")),
        )
        .route(
            "/api/v1/count/protected",
            get(protected_count).route_layer(guard(&policies.protected, "protected")),
        )
        .with_state(state.clone());

    // The advertised status page is `{context}/`, which a nested `/` does not match.
    let app = if context_path.is_empty() {
        routes
    } else {
        Router::new()
            .nest(context_path, routes)
            .route(&format!("{context_path}/"), get(home).with_state(state))
    };
    let app = app.merge(
        SwaggerUi::new(format!("{context_path}/swagger-ui"))
            .url(format!("{context_path}/api-docs/openapi.json"), ApiDoc::openapi()),
    );

    app.layer(SetResponseHeaderLayer::overriding(SERVICE_NAME_HEADER, service_name))
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize, ToSchema)]
pub struct HomeInfo {
    #[schema(example = "counter-app API")]
    message: String,
    #[schema(example = "running")]
    status: &'static str,
    version: &'static str,
    #[schema(example = "development")]
    environment: String,
}

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Application information", body = HomeInfo))
)]
async fn home(State(state): State<AppState>) -> Json<HomeInfo> {
    Json(HomeInfo {
        message: format!("{} API", state.app_name),
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.environment.clone(),
    })
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    #[schema(example = "counter-app")]
    service_id: String,
    instance_id: String,
    status: HealthStatus,
    registration: LifecycleState,
    #[schema(example = "0d 1h 5m 12s")]
    uptime: String,
    timestamp: DateTime<Utc>,
    /// Informational only; the status comes from the listener.
    metrics: ResourceUsage,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Listener accepting connections", body = HealthResponse),
        (status = 503, description = "Listener not accepting connections", body = HealthResponse)
    )
)]
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = HealthStatus::from_accepting(state.listener.is_accepting());
    let body = HealthResponse {
        service_id: state.app_name.clone(),
        instance_id: state.lifecycle.instance().instance_id,
        status,
        registration: state.lifecycle.state(),
        uptime: format_uptime(state.started_at.elapsed()),
        timestamp: Utc::now(),
        metrics: state.process.sample(),
    };
    let code = if status.is_up() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Incremented,
    Reset,
}

#[derive(Serialize, ToSchema)]
pub struct CounterResponse {
    count: i64,
    status: OperationStatus,
    metadata: Counter,
    /// Proofs that authorized the call, e.g. `CERTIFICATE+TOKEN`.
    #[schema(example = "CERTIFICATE")]
    auth_type: String,
    #[schema(example = "cn=client.counter-app.local")]
    caller: String,
}

impl CounterResponse {
    fn new(counter: Counter, status: OperationStatus, decision: &AuthDecision) -> Self {
        Self {
            count: counter.value,
            status,
            metadata: counter,
            auth_type: decision.describe_methods(),
            caller: decision.principal.to_string(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct CounterDetails {
    status: OperationStatus,
    counter: Counter,
}

#[utoipa::path(
    get,
    path = "/api/v1/count",
    responses(
        (status = 200, description = "Current count", body = CounterResponse),
        (status = 401, description = "Authentication required", body = ErrorBody)
    ),
    security(("api_jwt" = []), ())
)]
async fn get_count(State(state): State<AppState>, Extension(decision): Extension<AuthDecision>) -> Json<CounterResponse> {
    let counter = state.counter.lock().clone();
    Json(CounterResponse::new(counter, OperationStatus::Success, &decision))
}

#[utoipa::path(
    get,
    path = "/api/v1/count/increment",
    responses(
        (status = 200, description = "Counter incremented", body = CounterResponse),
        (status = 401, description = "Authentication required", body = ErrorBody)
    ),
    security(("api_jwt" = []), ())
)]
async fn increment_count(
    State(state): State<AppState>,
    Extension(decision): Extension<AuthDecision>,
) -> Json<CounterResponse> {
    let counter = {
        let mut counter = state.counter.lock();
        counter.increment();
        counter.clone()
    };
    Json(CounterResponse::new(counter, OperationStatus::Incremented, &decision))
}

#[utoipa::path(
    get,
    path = "/api/v1/count/reset",
    responses(
        (status = 200, description = "Counter reset", body = CounterResponse),
        (status = 401, description = "Authentication required", body = ErrorBody)
    ),
    security(("api_jwt" = []), ())
)]
async fn reset_count(State(state): State<AppState>, Extension(decision): Extension<AuthDecision>) -> Json<CounterResponse> {
    let counter = {
        let mut counter = state.counter.lock();
        counter.reset();
        counter.clone()
    };
    Json(CounterResponse::new(counter, OperationStatus::Reset, &decision))
}

#[utoipa::path(
    get,
    path = "/api/v1/count/details",
    responses(
        (status = 200, description = "Counter details", body = CounterDetails),
        (status = 401, description = "Authentication required", body = ErrorBody)
    ),
    security(("api_jwt" = []), ())
)]
async fn counter_details(State(state): State<AppState>) -> Json<CounterDetails> {
    Json(CounterDetails {
        status: OperationStatus::Success,
        counter: state.counter.lock().clone(),
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/count/protected",
    responses(
        (status = 200, description = "Current count, token with required scope", body = CounterResponse),
        (status = 401, description = "Token missing, invalid or lacking scope", body = ErrorBody)
    ),
    security(("api_jwt" = ["counter-app.read"]))
)]
async fn protected_count(
    State(state): State<AppState>,
    Extension(decision): Extension<AuthDecision>,
) -> Json<CounterResponse> {
    let counter = state.counter.lock().clone();
    Json(CounterResponse::new(counter, OperationStatus::Success, &decision))
}
