use std::{convert::Infallible, future::Future, io};

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::hub::Hub;

/// Frames buffered between a connection loop and the HTTP body.
const FRAME_BUFFER: usize = 16;

/// Where a subscriber's connection loop writes its frames.
///
/// `cancelled` resolves once the remote side has gone away; the hub treats
/// that as the end of the subscription.
pub trait Transport: Send {
    fn write(&mut self, frame: &str) -> impl Future<Output = io::Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    fn cancelled(&self) -> impl Future<Output = ()> + Send;
}

/// Transport backed by a bounded channel of encoded frames.
///
/// The receiving half usually feeds an HTTP response body. Dropping it
/// cancels the transport.
pub struct ChannelTransport {
    frames: mpsc::Sender<Bytes>,
}

impl ChannelTransport {
    pub fn new(frames: mpsc::Sender<Bytes>) -> Self {
        Self { frames }
    }

    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (frames, receiver) = mpsc::channel(buffer);
        (Self::new(frames), receiver)
    }
}

impl Transport for ChannelTransport {
    async fn write(&mut self, frame: &str) -> io::Result<()> {
        self.frames
            .send(Bytes::copy_from_slice(frame.as_bytes()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event stream receiver closed"))
    }

    async fn flush(&mut self) -> io::Result<()> {
        // Each frame is handed over whole, so there is nothing left to push.
        Ok(())
    }

    async fn cancelled(&self) {
        self.frames.closed().await
    }
}

/// Registers a subscriber in `zone` and answers with its event stream.
///
/// The connection loop runs on its own task and ends when the client drops
/// the response body.
pub fn event_stream(hub: &Hub, zone: &str) -> Response {
    let subscription = match hub.register(zone) {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(zone, error = %err, "failed to register subscriber");
            return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response();
        }
    };

    let (transport, frames) = ChannelTransport::pair(FRAME_BUFFER);
    tokio::spawn(async move {
        let client_id = subscription.client_id().to_string();
        if let Err(err) = subscription.serve(transport).await {
            debug!(%client_id, error = %err, "event stream closed with error");
        }
    });

    let body = futures::stream::unfold(frames, |mut frames| async move {
        frames
            .recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(frame), frames))
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
