//! Outbound mail delivery.
//!
//! Loads a `courier.config.ron`, wires the queue store, message store,
//! resolver, sender and DKIM signer together, and runs the queue manager
//! until told to stop.

pub mod config;
pub mod controller;

pub use config::Courier;
pub use controller::Controller;
