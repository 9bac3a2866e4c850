pub mod health;
pub mod publish;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(publish::router())
        .merge(crate::gateway::server::router())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        publish::publish,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            health::HealthResponse,
            publish::PublishResponse,
        )
    ),
    tags(
        (name = "Health", description = "Liveness and hub statistics"),
        (name = "Publish", description = "Push notifications into the hub"),
    )
)]
pub struct ApiDoc;
