use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, patch, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use services::AppState;

async fn csp_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    let api = student_routes()
        .nest("/admin", admin_routes())
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            middlewares::auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler).layer(middleware::from_fn_with_state(
                app_state.clone(),
                handlers::metrics_auth_middleware,
            )),
        )
        .nest("/api", api)
        .with_state(app_state)
        .layer(cors)
        .layer(middleware::from_fn(csp_middleware))
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn student_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Quiz status
        .route(
            "/courses/{course_id}/quizzes/status",
            get(handlers::quizzes::course_status),
        )
        .route(
            "/courses/{course_id}/quizzes/status/stream",
            get(handlers::quizzes::status_stream),
        )
        .route("/quizzes/{quiz_id}/status", get(handlers::quizzes::quiz_status))
        .route(
            "/quizzes/{quiz_id}/extra-attempt-requests",
            post(handlers::quizzes::request_extra_attempt),
        )
        // Attempts
        .route(
            "/quizzes/{quiz_id}/attempts",
            post(handlers::attempts::start_attempt),
        )
        .route("/attempts/{run_id}", get(handlers::attempts::get_attempt))
        .route(
            "/attempts/{run_id}/answers/{index}",
            put(handlers::attempts::record_answer),
        )
        .route(
            "/attempts/{run_id}/submit",
            post(handlers::attempts::submit_attempt),
        )
        .route(
            "/attempts/{run_id}/stream",
            get(handlers::attempts::attempt_stream),
        )
        // Modules
        .route(
            "/courses/{course_id}/modules/access",
            get(handlers::modules::list_access),
        )
        .route(
            "/courses/{course_id}/modules/{module_id}/open",
            post(handlers::modules::open_module),
        )
        // Notifications
        .route(
            "/courses/{course_id}/feed",
            get(handlers::notifications::course_feed),
        )
        .route(
            "/courses/{course_id}/feed/{item_id}/dismiss",
            post(handlers::notifications::dismiss_item),
        )
        .route(
            "/notifications/{notification_id}/read",
            post(handlers::notifications::mark_read),
        )
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/progress/level", patch(handlers::admin::set_level))
        .route("/quizzes", post(handlers::admin::create_quiz))
        .route(
            "/extra-attempt-requests/{request_id}/approve",
            post(handlers::admin::approve_extra_request),
        )
        .route(
            "/extra-attempt-requests/{request_id}/reject",
            post(handlers::admin::reject_extra_request),
        )
        .route_layer(middleware::from_fn(
            middlewares::auth::staff_guard_middleware,
        ))
}
