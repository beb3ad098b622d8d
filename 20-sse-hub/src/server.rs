use std::future::Future;

use anyhow::Result;
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    error::Error,
    hub::{Hub, Packet},
    message::Message,
    transport,
};

#[derive(Debug, Default, Deserialize)]
struct SubscribeParams {
    #[serde(default)]
    zone: String,
}

#[derive(Debug, Default, Deserialize)]
struct SendParams {
    #[serde(default)]
    zone: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: String,
}

/// Demo HTTP surface over a hub.
///
/// - `GET /events?zone=` opens an event stream.
/// - `GET /send?zone=&client_id=&event=&data=` sends to one client when
///   `client_id` is set, otherwise broadcasts to the zone or to everyone.
pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/events", get(subscribe))
        .route("/send", get(send))
        .with_state(hub)
}

/// Serves the demo routes on `listener` until `shutdown` resolves.
pub async fn run_until<F>(listener: TcpListener, hub: Hub, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("hub server stopped");
    Ok(())
}

pub async fn run_until_ctrl_c(listener: TcpListener, hub: Hub) -> Result<()> {
    run_until(listener, hub, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    })
    .await
}

async fn subscribe(State(hub): State<Hub>, Query(params): Query<SubscribeParams>) -> Response {
    transport::event_stream(&hub, &params.zone)
}

async fn send(State(hub): State<Hub>, Query(params): Query<SendParams>) -> Response {
    let message = Message::new(params.event, params.data);
    let packet = if params.client_id.is_empty() {
        Packet::zone(params.zone, message)
    } else {
        Packet::unicast(params.zone, params.client_id, message)
    };

    match hub.send(packet).await {
        Ok(()) => (StatusCode::OK, "sent").into_response(),
        Err(err) => {
            warn!(error = %err, "send request failed");
            (status_for(&err), err.to_string()).into_response()
        }
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidMessage | Error::MissingTarget => StatusCode::BAD_REQUEST,
        Error::ZoneNotFound(_) | Error::NoConnections(_) => StatusCode::NOT_FOUND,
        Error::DeliveryFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
