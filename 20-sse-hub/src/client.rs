use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use futures::TryStreamExt;
use reqwest::{
    Method, Response,
    header::{ACCEPT, CACHE_CONTROL},
};
use tokio::{
    io::AsyncBufRead,
    select,
    sync::watch,
    task::AbortHandle,
};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::{decoder::Decoder, message::Message};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

const LAST_EVENT_ID: &str = "Last-Event-ID";

/// Disconnect reason reported when [`Client::stop`] ends a connection cycle.
pub const STOPPED_REASON: &str = "client stopped";

pub type EventCallback = Arc<dyn Fn(&Message) + Send + Sync>;
type Hook = Arc<dyn Fn() + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Where and how the client connects.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub method: Method,
    /// Pause between a lost connection and the next attempt. Zero selects
    /// [`DEFAULT_RECONNECT_DELAY`].
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

#[derive(Default)]
struct Handlers {
    events: HashMap<String, EventCallback>,
    on_connect: Option<Hook>,
    on_disconnect: Option<DisconnectHook>,
    on_exit: Option<Hook>,
}

/// Event-stream consumer that reconnects until told to stop.
///
/// Cloning yields another handle to the same client, which is how
/// [`Client::stop`] is usually reached while [`Client::start`] is running.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(mut config: ClientConfig) -> Self {
        if config.reconnect_delay.is_zero() {
            config.reconnect_delay = DEFAULT_RECONNECT_DELAY;
        }
        let (state, _) = watch::channel(ClientState::Disconnected);
        let (stop, _) = watch::channel(false);

        Self {
            inner: Arc::new(ClientInner {
                config,
                http: reqwest::Client::new(),
                handlers: Mutex::new(Handlers::default()),
                state,
                stop,
                last_event_id: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Registers the callback for `event`, replacing any earlier one.
    /// Messages whose event has no callback are discarded.
    pub fn subscribe_event<F>(&self, event: impl Into<String>, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner
            .handlers()
            .events
            .insert(event.into(), Arc::new(callback));
    }

    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers().on_connect = Some(Arc::new(hook));
    }

    /// Called with a human-readable reason whenever an attempt fails or an
    /// established stream ends.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.handlers().on_disconnect = Some(Arc::new(hook));
    }

    pub fn on_exit<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers().on_exit = Some(Arc::new(hook));
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Runs the connect loop in the background and returns once [`Client::stop`]
    /// has been called and the loop has wound down.
    pub async fn start(&self) {
        let mut stop = self.inner.stop.subscribe();
        let connect_loop = tokio::spawn(run_connect_loop(Arc::clone(&self.inner)));

        stopped(&mut stop).await;
        if let Err(err) = connect_loop.await {
            warn!(error = %err, "connect loop ended abnormally");
        }

        self.inner.set_state(ClientState::Stopped);
        info!(url = %self.inner.config.url, "event stream client stopped");
        let exit = self.inner.handlers().on_exit.clone();
        if let Some(hook) = exit {
            hook();
        }
    }

    /// Asks the connect loop to finish. Safe to call more than once.
    ///
    /// A connection in progress is closed and reported to the disconnect
    /// hook with [`STOPPED_REASON`]; no further attempts are made.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }
}

struct ClientInner {
    config: ClientConfig,
    http: reqwest::Client,
    handlers: Mutex<Handlers>,
    state: watch::Sender<ClientState>,
    stop: watch::Sender<bool>,
    last_event_id: Mutex<Option<String>>,
}

impl ClientInner {
    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_event_id(&self) -> MutexGuard<'_, Option<String>> {
        self.last_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    /// Opens one stream and follows it until it ends. Returns why it ended.
    async fn run_connection(self: &Arc<Self>) -> String {
        let response = match self.open_stream().await {
            Ok(response) => response,
            Err(err) => return format!("{err:#}"),
        };

        self.set_state(ClientState::Connected);
        info!(url = %self.config.url, "event stream connected");
        let connect = self.handlers().on_connect.clone();
        if let Some(hook) = connect {
            hook();
        }

        let body = StreamReader::new(Box::pin(response.bytes_stream().map_err(io::Error::other)));
        let listener = tokio::spawn(listen(Arc::clone(self), Decoder::new(body)));
        let _guard = AbortOnDrop(listener.abort_handle());

        match listener.await {
            Ok(reason) => reason,
            Err(err) => format!("listener task failed: {err}"),
        }
    }

    async fn open_stream(&self) -> Result<Response> {
        let mut request = self
            .http
            .request(self.config.method.clone(), &self.config.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        let last_id = self.last_event_id().clone();
        if let Some(id) = last_id {
            request = request.header(LAST_EVENT_ID, id);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to connect to {}", self.config.url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("server responded with status {status}");
        }
        Ok(response)
    }

    fn dispatch(&self, message: Message) {
        if !message.id.is_empty() {
            *self.last_event_id() = Some(message.id.clone());
        }

        // Comment-only units such as keep-alives carry nothing to dispatch.
        if message.event.is_empty() && message.data.is_empty() {
            debug!(comment = %message.comment, "skipping comment-only message");
            return;
        }

        let callback = self.handlers().events.get(&message.event).cloned();
        match callback {
            Some(callback) => callback(&message),
            None => debug!(event = %message.event, "no callback for event"),
        }
    }

    fn notify_disconnect(&self, reason: &str) {
        let hook = self.handlers().on_disconnect.clone();
        if let Some(hook) = hook {
            hook(reason);
        }
    }
}

async fn run_connect_loop(inner: Arc<ClientInner>) {
    let mut stop = inner.stop.subscribe();

    loop {
        if *stop.borrow() {
            break;
        }

        inner.set_state(ClientState::Connecting);
        let outcome = select! {
            _ = stopped(&mut stop) => None,
            reason = inner.run_connection() => Some(reason),
        };

        inner.set_state(ClientState::Disconnected);
        let Some(reason) = outcome else {
            // Stopping tears the stream down but still closes out the cycle.
            info!(url = %inner.config.url, "event stream closed on stop");
            inner.notify_disconnect(STOPPED_REASON);
            break;
        };
        warn!(url = %inner.config.url, %reason, "event stream disconnected, reconnecting");
        inner.notify_disconnect(&reason);

        select! {
            _ = stopped(&mut stop) => break,
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }
    }

    inner.set_state(ClientState::Disconnected);
    debug!(url = %inner.config.url, "connect loop finished");
}

/// Decodes messages in order and hands them to callbacks until the stream ends.
async fn listen<R>(inner: Arc<ClientInner>, mut decoder: Decoder<R>) -> String
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match decoder.decode().await {
            Ok(message) => inner.dispatch(message),
            Err(err) => {
                debug!(error = %err, "listener finished");
                return err.to_string();
            }
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
