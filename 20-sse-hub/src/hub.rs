//! Connection registry and message dispatcher.
//!
//! Subscribers are grouped into zones. Each registered connection (a link)
//! owns a bounded mailbox that its connection loop drains into a
//! [`Transport`]. Producers address packets to one client, one zone, or
//! every zone; the last case goes through a background dispatch loop so the
//! sender never waits on fan-out.
//!
//! Locking: the registry mutex only guards map structure. Mailbox senders are
//! cloned under it and used after it is released, so a slow subscriber never
//! stalls registry operations. Client id reservations use a second, separate
//! mutex; the two are never held together.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use tokio::{
    select,
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    message::Message,
    transport::Transport,
};

pub const DEFAULT_ZONE: &str = "default";
pub const PING_EVENT: &str = "ping";

const KEEP_ALIVE_FRAME: &str = ": keep-alive\n\n";

/// Attempts made to find an unused client id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

type Mailbox = mpsc::Sender<Arc<Message>>;
type Registry = HashMap<String, HashMap<String, Link>>;

/// Tunables for a [`Hub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages a single subscriber can have queued before deliveries to it
    /// are dropped (broadcast) or refused (unicast).
    pub mailbox_capacity: usize,
    /// Global broadcasts waiting for the dispatch loop.
    pub broadcast_capacity: usize,
    /// Length of generated client ids.
    pub id_length: usize,
    /// Idle connections get a comment frame this often. Writing it is what
    /// notices peers that vanished without closing the stream.
    pub keep_alive: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 32,
            broadcast_capacity: 64,
            id_length: 16,
            keep_alive: Some(Duration::from_secs(15)),
        }
    }
}

/// A message plus its routing.
///
/// A non-empty `client_id` always means unicast. Otherwise `broadcast` with a
/// zone targets that zone, and `broadcast` without one targets every zone.
#[derive(Debug, Clone)]
pub struct Packet {
    pub message: Arc<Message>,
    pub zone: String,
    pub client_id: String,
    pub broadcast: bool,
}

impl Packet {
    pub fn unicast(zone: impl Into<String>, client_id: impl Into<String>, message: Message) -> Self {
        Self {
            message: Arc::new(message),
            zone: zone.into(),
            client_id: client_id.into(),
            broadcast: false,
        }
    }

    pub fn zone(zone: impl Into<String>, message: Message) -> Self {
        Self {
            message: Arc::new(message),
            zone: zone.into(),
            client_id: String::new(),
            broadcast: true,
        }
    }

    pub fn everyone(message: Message) -> Self {
        Self::zone(String::new(), message)
    }
}

/// Records emitted to the optional diagnostics sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    Connected { zone: String, client_id: String },
    Disconnected { zone: String, client_id: String },
    Delivered { zone: String, client_id: String, event: String },
    /// A broadcast skipped this subscriber because its mailbox was full.
    Dropped { zone: String, client_id: String },
    DispatchPanicked(String),
}

/// Public view of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub zone: String,
    pub client_id: String,
    pub created_at: SystemTime,
}

struct Link {
    mailbox: Mailbox,
    created_at: SystemTime,
    serial: u64,
}

/// Handle to the shared registry. Cloning is cheap.
#[derive(Clone)]
pub struct Hub {
    state: Arc<HubState>,
}

impl Hub {
    /// Creates a hub and starts its dispatch loop. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: HubConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_diagnostics(config: HubConfig, sink: mpsc::UnboundedSender<Diagnostic>) -> Self {
        Self::build(config, Some(sink))
    }

    fn build(config: HubConfig, diagnostics: Option<mpsc::UnboundedSender<Diagnostic>>) -> Self {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let state = Arc::new(HubState {
            config,
            zones: Mutex::new(HashMap::new()),
            client_ids: Mutex::new(HashSet::new()),
            next_serial: AtomicU64::new(1),
            broadcast_tx,
            diagnostics,
        });
        tokio::spawn(run_dispatch_loop(Arc::downgrade(&state), broadcast_rx));
        Self { state }
    }

    /// Registers a subscriber and streams its mailbox into `transport` until
    /// the transport is cancelled.
    pub async fn subscribe<T: Transport>(&self, transport: T, zone: &str) -> Result<()> {
        self.register(zone)?.serve(transport).await
    }

    /// Like [`Hub::subscribe`], with ids drawn from `generate` instead of
    /// being generated by the hub.
    pub async fn subscribe_with<T, F>(&self, transport: T, zone: &str, generate: F) -> Result<()>
    where
        T: Transport,
        F: FnMut() -> String,
    {
        self.register_with(zone, generate)?.serve(transport).await
    }

    /// Registers a subscriber under a generated id.
    pub fn register(&self, zone: &str) -> Result<Subscription> {
        let length = self.state.config.id_length.max(1);
        self.register_with(zone, || nanoid::nanoid!(length))
    }

    /// Registers a subscriber under an id produced by `generate`.
    ///
    /// Ids are unique across all zones. Empty or already live ids are
    /// rejected and `generate` is asked again, a bounded number of times.
    pub fn register_with<F>(&self, zone: &str, generate: F) -> Result<Subscription>
    where
        F: FnMut() -> String,
    {
        let zone = if zone.is_empty() { DEFAULT_ZONE } else { zone }.to_string();
        let client_id = self.state.reserve_client_id(generate)?;
        let serial = self.state.next_serial.fetch_add(1, Ordering::Relaxed);
        let (mailbox, inbox) = mpsc::channel(self.state.config.mailbox_capacity.max(1));

        self.state.lock_zones().entry(zone.clone()).or_default().insert(
            client_id.clone(),
            Link {
                mailbox: mailbox.clone(),
                created_at: SystemTime::now(),
                serial,
            },
        );

        let ping = Message::new(
            PING_EVENT,
            format!("{zone}->{client_id} connection established"),
        );
        if mailbox.try_send(Arc::new(ping)).is_err() {
            debug!(%zone, %client_id, "could not queue connection ping");
        }

        info!(%zone, %client_id, "subscriber registered");
        self.state.report(|| Diagnostic::Connected {
            zone: zone.clone(),
            client_id: client_id.clone(),
        });

        Ok(Subscription {
            hub: self.clone(),
            zone,
            client_id,
            serial,
            inbox,
        })
    }

    /// Removes `(zone, client_id)` if present. Calling it again is a no-op.
    ///
    /// Dropping the registry's mailbox sender ends that subscriber's
    /// connection loop once it has drained what is already queued.
    pub fn unregister(&self, zone: &str, client_id: &str) {
        self.state.remove_link(zone, client_id, None);
    }

    /// Routes a packet to its recipients.
    ///
    /// Unicast fails with `DeliveryFailed` when the client is unknown or its
    /// mailbox is full. Zone broadcasts drop silently for full mailboxes.
    /// Global broadcasts are queued for the dispatch loop and return once
    /// queued.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        packet.message.validate()?;

        if !packet.client_id.is_empty() {
            return self
                .state
                .unicast(&packet.zone, &packet.client_id, &packet.message);
        }
        if !packet.broadcast {
            return Err(Error::MissingTarget);
        }
        if packet.zone.is_empty() {
            return self.state.broadcast_tx.send(packet).await.map_err(|_| {
                warn!("broadcast queue closed");
                Error::DeliveryFailed("all zones".to_string())
            });
        }
        self.state.broadcast_zone(&packet.zone, &packet.message)
    }

    /// Names of every zone seen so far, sorted.
    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self.state.lock_zones().keys().cloned().collect();
        zones.sort();
        zones
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock_zones().values().map(HashMap::len).sum()
    }

    /// Connections currently registered in `zone`, oldest first.
    pub fn links(&self, zone: &str) -> Vec<LinkInfo> {
        let zones = self.state.lock_zones();
        let Some(links) = zones.get(zone) else {
            return Vec::new();
        };
        let mut infos: Vec<(u64, LinkInfo)> = links
            .iter()
            .map(|(client_id, link)| {
                (
                    link.serial,
                    LinkInfo {
                        zone: zone.to_string(),
                        client_id: client_id.clone(),
                        created_at: link.created_at,
                    },
                )
            })
            .collect();
        infos.sort_by_key(|(serial, _)| *serial);
        infos.into_iter().map(|(_, info)| info).collect()
    }

    pub fn contains(&self, zone: &str, client_id: &str) -> bool {
        self.state
            .lock_zones()
            .get(zone)
            .is_some_and(|links| links.contains_key(client_id))
    }
}

/// A registered link waiting to be served.
///
/// Dropping it, served or not, closes the mailbox and unregisters the link.
pub struct Subscription {
    hub: Hub,
    zone: String,
    client_id: String,
    serial: u64,
    inbox: mpsc::Receiver<Arc<Message>>,
}

impl Subscription {
    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Writes mailbox messages to `transport` until it is cancelled, the link
    /// is unregistered, or a write fails.
    pub async fn serve<T: Transport>(mut self, mut transport: T) -> Result<()> {
        let keep_alive = self.hub.state.config.keep_alive;
        let mut heartbeat = keep_alive.filter(|period| !period.is_zero()).map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            select! {
                _ = transport.cancelled() => {
                    debug!(zone = %self.zone, client_id = %self.client_id, "transport cancelled");
                    return Ok(());
                }
                next = self.inbox.recv() => {
                    let Some(message) = next else {
                        debug!(zone = %self.zone, client_id = %self.client_id, "link unregistered");
                        return Ok(());
                    };
                    self.deliver(&mut transport, &message).await?;
                }
                _ = next_tick(&mut heartbeat) => {
                    transport.write(KEEP_ALIVE_FRAME).await?;
                    transport.flush().await?;
                }
            }
        }
    }

    async fn deliver<T: Transport>(&self, transport: &mut T, message: &Message) -> Result<()> {
        let frame = match message.format() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(client_id = %self.client_id, error = %err, "skipping unformattable message");
                return Ok(());
            }
        };

        transport.write(&frame).await?;
        transport.flush().await?;

        self.hub.state.report(|| Diagnostic::Delivered {
            zone: self.zone.clone(),
            client_id: self.client_id.clone(),
            event: message.event.clone(),
        });
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inbox.close();
        self.hub
            .state
            .remove_link(&self.zone, &self.client_id, Some(self.serial));
    }
}

struct HubState {
    config: HubConfig,
    zones: Mutex<Registry>,
    client_ids: Mutex<HashSet<String>>,
    next_serial: AtomicU64,
    broadcast_tx: mpsc::Sender<Packet>,
    diagnostics: Option<mpsc::UnboundedSender<Diagnostic>>,
}

impl HubState {
    fn lock_zones(&self) -> MutexGuard<'_, Registry> {
        self.zones.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_client_ids(&self) -> MutexGuard<'_, HashSet<String>> {
        self.client_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, diagnostic: impl FnOnce() -> Diagnostic) {
        if let Some(sink) = &self.diagnostics {
            // A dropped receiver just means nobody is listening any more.
            let _ = sink.send(diagnostic());
        }
    }

    fn reserve_client_id<F>(&self, mut generate: F) -> Result<String>
    where
        F: FnMut() -> String,
    {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = generate();
            if candidate.is_empty() {
                continue;
            }
            if self.lock_client_ids().insert(candidate.clone()) {
                return Ok(candidate);
            }
            debug!(client_id = %candidate, "client id already in use");
        }
        Err(Error::DuplicateClientId(MAX_ID_ATTEMPTS))
    }

    /// Removes a link. With `serial` set, only that exact link is removed so a
    /// stale connection loop cannot evict a newer registration under the same id.
    fn remove_link(&self, zone: &str, client_id: &str, serial: Option<u64>) {
        let removed = {
            let mut zones = self.lock_zones();
            let Some(links) = zones.get_mut(zone) else {
                return;
            };
            let current = links
                .get(client_id)
                .is_some_and(|link| serial.is_none_or(|serial| serial == link.serial));
            if current { links.remove(client_id) } else { None }
        };

        if removed.is_some() {
            self.lock_client_ids().remove(client_id);
            info!(%zone, %client_id, "subscriber unregistered");
            self.report(|| Diagnostic::Disconnected {
                zone: zone.to_string(),
                client_id: client_id.to_string(),
            });
        }
    }

    fn unicast(&self, zone: &str, client_id: &str, message: &Arc<Message>) -> Result<()> {
        let mailbox = {
            let zones = self.lock_zones();
            if zone.is_empty() {
                zones
                    .values()
                    .find_map(|links| links.get(client_id))
                    .map(|link| link.mailbox.clone())
            } else {
                let links = zones
                    .get(zone)
                    .ok_or_else(|| Error::ZoneNotFound(zone.to_string()))?;
                if links.is_empty() {
                    return Err(Error::NoConnections(zone.to_string()));
                }
                links.get(client_id).map(|link| link.mailbox.clone())
            }
        };

        let Some(mailbox) = mailbox else {
            debug!(%zone, %client_id, "unicast target not registered");
            return Err(Error::DeliveryFailed(client_id.to_string()));
        };
        mailbox.try_send(Arc::clone(message)).map_err(|err| {
            debug!(%zone, %client_id, error = %err, "unicast mailbox unavailable");
            Error::DeliveryFailed(client_id.to_string())
        })
    }

    fn broadcast_zone(&self, zone: &str, message: &Arc<Message>) -> Result<()> {
        let targets: Vec<(String, String, Mailbox)> = {
            let zones = self.lock_zones();
            let links = zones
                .get(zone)
                .ok_or_else(|| Error::ZoneNotFound(zone.to_string()))?;
            if links.is_empty() {
                return Err(Error::NoConnections(zone.to_string()));
            }
            links
                .iter()
                .map(|(client_id, link)| (zone.to_string(), client_id.clone(), link.mailbox.clone()))
                .collect()
        };
        self.fan_out(targets, message);
        Ok(())
    }

    fn broadcast_all(&self, message: &Arc<Message>) {
        let targets: Vec<(String, String, Mailbox)> = self
            .lock_zones()
            .iter()
            .flat_map(|(zone, links)| {
                links
                    .iter()
                    .map(|(client_id, link)| (zone.clone(), client_id.clone(), link.mailbox.clone()))
            })
            .collect();
        self.fan_out(targets, message);
    }

    fn fan_out(&self, targets: Vec<(String, String, Mailbox)>, message: &Arc<Message>) {
        for (zone, client_id, mailbox) in targets {
            match mailbox.try_send(Arc::clone(message)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(%zone, %client_id, "mailbox full, dropping broadcast");
                    self.report(|| Diagnostic::Dropped { zone, client_id });
                }
                // The link is being torn down.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Runs one dispatch cycle, turning a panic into a diagnostic.
    fn guard_cycle(&self, cycle: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cycle)) {
            let reason = panic_reason(payload.as_ref());
            error!(%reason, "broadcast dispatch panicked");
            self.report(|| Diagnostic::DispatchPanicked(reason));
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_dispatch_loop(state: Weak<HubState>, mut queue: mpsc::Receiver<Packet>) {
    while let Some(packet) = queue.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        state.guard_cycle(|| state.broadcast_all(&packet.message));
    }
    debug!("broadcast dispatch loop stopped");
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        (*reason).to_string()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn fixed_id(id: &'static str) -> impl FnMut() -> String {
        move || id.to_string()
    }

    async fn next(subscription: &mut Subscription) -> Arc<Message> {
        timeout(Duration::from_secs(1), subscription.inbox.recv())
            .await
            .expect("timed out waiting for mailbox")
            .expect("mailbox closed")
    }

    async fn skip_ping(subscription: &mut Subscription) {
        let ping = next(subscription).await;
        assert_eq!(ping.event, PING_EVENT);
    }

    #[tokio::test]
    async fn registration_queues_connection_ping() {
        let hub = Hub::new(HubConfig::default());
        let mut sub = hub.register_with("lobby", fixed_id("u1")).expect("register");

        let ping = next(&mut sub).await;
        assert_eq!(ping.event, PING_EVENT);
        assert_eq!(ping.data, "lobby->u1 connection established");
    }

    #[tokio::test]
    async fn empty_zone_falls_back_to_default() {
        let hub = Hub::new(HubConfig::default());
        let sub = hub.register("").expect("register");
        assert_eq!(sub.zone(), DEFAULT_ZONE);
        assert!(hub.contains(DEFAULT_ZONE, sub.client_id()));
    }

    #[tokio::test]
    async fn unicast_reaches_only_its_target() {
        let hub = Hub::new(HubConfig::default());
        let mut u1 = hub.register_with("zone-a", fixed_id("u1")).expect("u1");
        let mut u2 = hub.register_with("zone-a", fixed_id("u2")).expect("u2");
        skip_ping(&mut u1).await;
        skip_ping(&mut u2).await;

        hub.send(Packet::unicast("zone-a", "u1", Message::new("direct", "for u1")))
            .await
            .expect("send");

        assert_eq!(next(&mut u1).await.data, "for u1");
        assert!(u2.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_id_takes_precedence_over_broadcast_flag() {
        let hub = Hub::new(HubConfig::default());
        let mut u1 = hub.register_with("zone-a", fixed_id("u1")).expect("u1");
        let mut u2 = hub.register_with("zone-a", fixed_id("u2")).expect("u2");
        skip_ping(&mut u1).await;
        skip_ping(&mut u2).await;

        let mut packet = Packet::unicast("zone-a", "u2", Message::new("direct", "only u2"));
        packet.broadcast = true;
        hub.send(packet).await.expect("send");

        assert_eq!(next(&mut u2).await.data, "only u2");
        tokio::task::yield_now().await;
        assert!(u1.inbox.try_recv().is_err());

        // The same holds with no zone, which would otherwise mean everyone.
        let mut packet = Packet::unicast("", "u1", Message::new("direct", "only u1"));
        packet.broadcast = true;
        hub.send(packet).await.expect("send");

        assert_eq!(next(&mut u1).await.data, "only u1");
        tokio::task::yield_now().await;
        assert!(u2.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn unicast_without_zone_finds_client() {
        let hub = Hub::new(HubConfig::default());
        let mut sub = hub.register_with("zone-b", fixed_id("solo")).expect("register");
        skip_ping(&mut sub).await;

        hub.send(Packet::unicast("", "solo", Message::new("direct", "found")))
            .await
            .expect("send");
        assert_eq!(next(&mut sub).await.data, "found");
    }

    #[tokio::test]
    async fn unicast_to_unknown_client_fails() {
        let hub = Hub::new(HubConfig::default());
        let _sub = hub.register_with("zone-a", fixed_id("u1")).expect("register");

        let err = hub
            .send(Packet::unicast("zone-a", "ghost", Message::new("x", "y")))
            .await
            .expect_err("unknown client");
        assert!(matches!(err, Error::DeliveryFailed(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn unicast_to_full_mailbox_fails() {
        let config = HubConfig {
            mailbox_capacity: 1,
            ..HubConfig::default()
        };
        let hub = Hub::new(config);
        // The connection ping already occupies the only slot.
        let _sub = hub.register_with("zone-a", fixed_id("u1")).expect("register");

        let err = hub
            .send(Packet::unicast("zone-a", "u1", Message::new("x", "y")))
            .await
            .expect_err("full mailbox");
        assert!(matches!(err, Error::DeliveryFailed(_)));
    }

    #[tokio::test]
    async fn zone_broadcast_drops_silently_for_full_mailbox() {
        let config = HubConfig {
            mailbox_capacity: 1,
            ..HubConfig::default()
        };
        let (sink, mut diagnostics) = mpsc::unbounded_channel();
        let hub = Hub::with_diagnostics(config, sink);
        let mut slow = hub.register_with("zone-a", fixed_id("slow")).expect("slow");
        let mut fast = hub.register_with("zone-a", fixed_id("fast")).expect("fast");
        skip_ping(&mut fast).await;

        hub.send(Packet::zone("zone-a", Message::new("news", "update")))
            .await
            .expect("broadcast succeeds despite a full mailbox");

        assert_eq!(next(&mut fast).await.data, "update");
        skip_ping(&mut slow).await;
        assert!(slow.inbox.try_recv().is_err());

        let mut dropped = false;
        while let Ok(diagnostic) = diagnostics.try_recv() {
            if diagnostic
                == (Diagnostic::Dropped {
                    zone: "zone-a".into(),
                    client_id: "slow".into(),
                })
            {
                dropped = true;
            }
        }
        assert!(dropped, "expected a drop diagnostic for the slow subscriber");
    }

    #[tokio::test]
    async fn zone_errors_distinguish_missing_and_empty() {
        let hub = Hub::new(HubConfig::default());

        let err = hub
            .send(Packet::zone("nowhere", Message::new("x", "y")))
            .await
            .expect_err("unknown zone");
        assert!(matches!(err, Error::ZoneNotFound(zone) if zone == "nowhere"));

        let sub = hub.register_with("emptied", fixed_id("gone")).expect("register");
        drop(sub);

        let err = hub
            .send(Packet::zone("emptied", Message::new("x", "y")))
            .await
            .expect_err("empty zone");
        assert!(matches!(err, Error::NoConnections(zone) if zone == "emptied"));

        let err = hub
            .send(Packet::unicast("emptied", "gone", Message::new("x", "y")))
            .await
            .expect_err("empty zone for unicast");
        assert!(matches!(err, Error::NoConnections(_)));
    }

    #[tokio::test]
    async fn invalid_messages_and_untargeted_packets_are_rejected() {
        let hub = Hub::new(HubConfig::default());
        let _sub = hub.register_with("zone-a", fixed_id("u1")).expect("register");

        let err = hub
            .send(Packet::zone("zone-a", Message::new("empty", "")))
            .await
            .expect_err("invalid message");
        assert!(matches!(err, Error::InvalidMessage));

        let mut packet = Packet::zone("zone-a", Message::new("x", "y"));
        packet.broadcast = false;
        let err = hub.send(packet).await.expect_err("no target");
        assert!(matches!(err, Error::MissingTarget));
    }

    #[tokio::test]
    async fn global_broadcast_reaches_every_zone() {
        let hub = Hub::new(HubConfig::default());
        let mut a = hub.register_with("zone-a", fixed_id("a")).expect("a");
        let mut b = hub.register_with("zone-b", fixed_id("b")).expect("b");
        skip_ping(&mut a).await;
        skip_ping(&mut b).await;

        hub.send(Packet::everyone(Message::new("all", "hello everyone")))
            .await
            .expect("queue broadcast");

        assert_eq!(next(&mut a).await.data, "hello everyone");
        assert_eq!(next(&mut b).await.data, "hello everyone");
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_across_zones() {
        let hub = Hub::new(HubConfig::default());
        let _first = hub.register_with("zone-a", fixed_id("same")).expect("first");

        let err = hub
            .register_with("zone-b", fixed_id("same"))
            .err()
            .expect("duplicate id must be rejected");
        assert!(matches!(err, Error::DuplicateClientId(_)));
    }

    #[tokio::test]
    async fn id_is_reusable_after_unregister() {
        let hub = Hub::new(HubConfig::default());
        let first = hub.register_with("zone-a", fixed_id("again")).expect("first");
        drop(first);
        let second = hub.register_with("zone-b", fixed_id("again")).expect("second");
        assert_eq!(second.client_id(), "again");
    }

    #[tokio::test]
    async fn unregister_twice_is_harmless() {
        let hub = Hub::new(HubConfig::default());
        let mut sub = hub.register_with("zone-a", fixed_id("u1")).expect("register");

        hub.unregister("zone-a", "u1");
        hub.unregister("zone-a", "u1");
        hub.unregister("missing-zone", "u1");

        assert!(!hub.contains("zone-a", "u1"));
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.zones(), vec!["zone-a".to_string()]);

        // Unregistering drops the registry sender; the queued ping drains first.
        skip_ping(&mut sub).await;
        assert!(sub.inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn stale_subscription_does_not_evict_newer_link() {
        let hub = Hub::new(HubConfig::default());
        let old = hub.register_with("zone-a", fixed_id("u1")).expect("old");
        hub.unregister("zone-a", "u1");
        let _new = hub.register_with("zone-a", fixed_id("u1")).expect("new");

        drop(old);
        assert!(hub.contains("zone-a", "u1"));
    }

    #[tokio::test]
    async fn links_report_registration_order() {
        let hub = Hub::new(HubConfig::default());
        let _a = hub.register_with("zone-a", fixed_id("first")).expect("a");
        let _b = hub.register_with("zone-a", fixed_id("second")).expect("b");

        let ids: Vec<String> = hub
            .links("zone-a")
            .into_iter()
            .map(|info| info.client_id)
            .collect();
        assert_eq!(ids, vec!["first".to_string(), "second".to_string()]);
        assert!(hub.links("zone-z").is_empty());
    }

    #[tokio::test]
    async fn dispatch_panic_is_reported_and_loop_survives() {
        let (sink, mut diagnostics) = mpsc::unbounded_channel();
        let hub = Hub::with_diagnostics(HubConfig::default(), sink);

        hub.state.guard_cycle(|| panic!("bad packet"));
        assert_eq!(
            diagnostics.recv().await,
            Some(Diagnostic::DispatchPanicked("bad packet".to_string()))
        );

        let mut sub = hub.register_with("zone-a", fixed_id("u1")).expect("register");
        skip_ping(&mut sub).await;
        hub.send(Packet::everyone(Message::new("after", "still running")))
            .await
            .expect("queue broadcast");
        assert_eq!(next(&mut sub).await.data, "still running");
    }

    #[tokio::test]
    async fn idle_link_gets_keep_alive_frames() {
        let hub = Hub::new(HubConfig {
            keep_alive: Some(Duration::from_millis(20)),
            ..HubConfig::default()
        });
        let (transport, mut frames) = crate::transport::ChannelTransport::pair(4);
        let sub = hub.register_with("idle", fixed_id("quiet")).expect("register");
        let serving = tokio::spawn(sub.serve(transport));

        let ping = timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("ping frame")
            .expect("open");
        assert!(ping.starts_with(b"data: idle->quiet"));
        let heartbeat = timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("keep-alive frame")
            .expect("open");
        assert_eq!(&heartbeat[..], KEEP_ALIVE_FRAME.as_bytes());

        // Either the cancellation or a failed heartbeat write ends the loop.
        drop(frames);
        let _ = timeout(Duration::from_secs(1), serving).await.expect("serve ends");
        assert!(!hub.contains("idle", "quiet"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn generated_ids_are_unique_under_concurrency() {
        let hub = Hub::new(HubConfig::default());

        let tasks: Vec<_> = (0..10_000)
            .map(|_| {
                let hub = hub.clone();
                tokio::spawn(async move { hub.register("load") })
            })
            .collect();

        let mut subscriptions = Vec::with_capacity(tasks.len());
        for task in tasks {
            subscriptions.push(task.await.expect("join").expect("register"));
        }

        let ids: HashSet<&str> = subscriptions.iter().map(Subscription::client_id).collect();
        assert_eq!(ids.len(), 10_000);
        assert_eq!(hub.connection_count(), 10_000);
    }
}
