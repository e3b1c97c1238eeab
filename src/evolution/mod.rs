//! Evolution API access: versioned endpoint catalog, fallback prober,
//! response normalization and a thin client on top.

pub mod client;
pub mod endpoints;
pub mod normalize;
pub mod prober;

pub use client::EvolutionClient;
pub use endpoints::{ApiVersion, Operation};
pub use normalize::{ChatKind, Contact, Message};
pub use prober::{EndpointProber, ProbeRequest};
