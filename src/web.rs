use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gateway::{CommandError, CommandGateway};

/// `GET /?all` returns the state map; `GET /?key=value[&...]` applies each
/// known key in order and echoes the applied values.
pub fn router(gateway: CommandGateway) -> Router {
    Router::new().route("/", get(handle)).with_state(gateway)
}

/// Serve until cancelled. A bind failure is logged and the frame keeps
/// running without its HTTP interface.
pub async fn serve(gateway: CommandGateway, bind_addr: SocketAddr, cancel: CancellationToken) {
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %bind_addr, "failed to bind http interface");
            return;
        }
    };
    info!(%bind_addr, "http interface listening");
    let app = router(gateway);
    if let Err(err) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
    {
        error!(error = %err, "http interface failed");
    }
}

async fn handle(
    State(gateway): State<CommandGateway>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let outcome = tokio::task::spawn_blocking(move || apply_params(&gateway, params)).await;
    match outcome {
        Ok(Ok(body)) => Json(body).into_response(),
        Ok(Err(message)) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response(),
        Err(err) => {
            error!(error = %err, "http command task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

/// Keys are applied in request order; a rejected key stops nothing that
/// was already applied but turns the response into an error.
fn apply_params(
    gateway: &CommandGateway,
    params: Vec<(String, String)>,
) -> Result<BTreeMap<String, Value>, String> {
    if params.is_empty() || params.iter().any(|(k, _)| k == "all") {
        return Ok(gateway.state());
    }
    let mut applied = BTreeMap::new();
    let mut errors = Vec::new();
    for (key, raw) in params {
        match gateway.execute(&key, &raw) {
            Ok(value) => {
                applied.insert(key, value);
            }
            Err(CommandError::Unknown(name)) => debug!(%name, "ignoring unknown http key"),
            Err(err) => {
                warn!(error = %err, "rejected http command");
                errors.push(err.to_string());
            }
        }
    }
    if errors.is_empty() {
        Ok(applied)
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::slideshow::Slideshow;
    use crate::store::MetadataStore;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = MetadataStore::open_in_memory().unwrap();
        let show = Slideshow::new(Configuration::default(), store, StdRng::seed_from_u64(2));
        router(CommandGateway::new(show))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn all_returns_state_map() {
        let (status, body) = get_json(app(), "/?all").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("empty"));
        assert!(body.get("time_delay").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_keys_are_ignored() {
        let (status, body) = get_json(app(), "/?shuffle=off&volume=11").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "shuffle": false }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_value_is_a_bad_request() {
        let app = app();
        let (status, body) = get_json(app.clone(), "/?fade_time=2&time_delay=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("time_delay"));

        let (_, state) = get_json(app, "/?all").await;
        assert_eq!(state["fade_time"], json!(2.0));
        assert_eq!(state["time_delay"], json!(200.0));
    }
}
