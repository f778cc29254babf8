use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// CORS + request tracing, applied once over the whole router
/// (spec.md §9: the ambient stack still carries `tower-http` even
/// though the HTTP surface itself is thin glue).
pub fn apply<S: Clone + Send + Sync + 'static>(router: Router<S>) -> Router<S> {
    router.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}
