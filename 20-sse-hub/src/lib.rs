//! Server-Sent Events hub with zone routing, plus a reconnecting client.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`message`] defines a protocol unit and its wire format.
//! - [`decoder`] turns a buffered byte stream back into messages.
//! - [`hub`] keeps the connection registry, grouped into zones, and routes
//!   packets to one client, one zone, or everyone.
//! - [`transport`] is the seam between a connection loop and the socket,
//!   with an axum adapter that serves a subscriber as an HTTP event stream.
//! - [`client`] consumes an event stream over HTTP, dispatching callbacks per
//!   event name and reconnecting after the stream ends.
//! - [`server`] and [`cli`] wire the pieces into the demo binary.
//!
//! Delivery is best effort. Broadcasts skip subscribers whose mailbox is
//! full; unicast reports the failure to the sender instead.

pub mod cli;
pub mod client;
pub mod decoder;
pub mod error;
pub mod hub;
pub mod message;
pub mod server;
pub mod transport;

pub use client::{Client, ClientConfig, ClientState};
pub use decoder::Decoder;
pub use error::{Error, Result};
pub use hub::{Diagnostic, Hub, HubConfig, Packet};
pub use message::Message;
