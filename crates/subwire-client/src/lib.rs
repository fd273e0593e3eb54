//! Client side of the subwire protocol.
//!
//! A [`Client`] owns one byte stream to a backend and multiplexes any number
//! of [`Subscription`]s over it. One task reads and dispatches incoming
//! frames; another serializes all outgoing ones.

pub mod client;
pub mod error;
pub mod subscription;

pub use client::{Client, ClientConfig};
pub use error::{ClientError, FatalCause, Result};
pub use subscription::{Subscription, SubscriptionStats};
