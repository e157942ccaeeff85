use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use entity::data::Bar;
use history::BarStore;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::watch};

use crate::event::stream::wait_for_stop;

#[derive(Debug, Default, Deserialize)]
pub struct BarFilter {
    pub exchange: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

pub fn router(store: BarStore) -> Router {
    Router::new().route("/", get(list_bars)).with_state(store)
}

/// Serves the stored bars on `addr` until the stop signal is raised.
pub async fn serve(addr: &str, store: BarStore, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {addr}"))?;
    info!("HTTP server listening on {addr}");

    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move { wait_for_stop(&mut stop).await })
        .await
        .context("HTTP server failed")
}

async fn list_bars(
    State(store): State<BarStore>,
    Query(filter): Query<BarFilter>,
) -> Result<Json<Vec<Bar>>, ApiError> {
    let exchange = filter.exchange.as_deref().filter(|exchange| !exchange.is_empty());

    match store.bars(exchange).await {
        Ok(bars) => Ok(Json(bars)),
        Err(error) => {
            error!("Failed to read stored bars: {error:?}");
            Err(ApiError::internal("failed to read stored bars"))
        }
    }
}
