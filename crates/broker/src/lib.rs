//! Event broker for tonetest suites.
//!
//! - [`wire`]: newline-delimited JSON frames
//! - [`server`]: the embedded broker ([`EmbeddedBroker`])
//! - [`client`]: a client connection ([`BrokerConnection`]) with suite-scoped
//!   [`Subscription`] buffers
//! - [`lifecycle`]: "connect or start embedded" ([`BrokerManager::ensure`])
//!
//! # Flow
//! ```text
//! publisher ──pub──► broker ──msg(sid)──► connection reader ──► Subscription buffer
//!                                                                   │
//!                                              wait call ◄── notify ┘
//! ```

pub mod client;
pub mod lifecycle;
pub mod server;
pub mod subscription;
pub mod wire;

pub use client::{BrokerConnection, ConnectOptions};
pub use lifecycle::{BrokerHandle, BrokerManager};
pub use server::EmbeddedBroker;
pub use subscription::{Batch, Subscription};
pub use wire::Frame;
