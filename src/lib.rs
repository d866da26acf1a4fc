//! Offline request interception and caching engine.
//!
//! Every intercepted request is classified, answered by a caching strategy
//! over generation-scoped stores and the network, and mutating requests made
//! while disconnected are parked in a durable queue for later replay.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod control;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod route;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use dispatcher::{Interception, InterceptionDispatcher};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use http::{Destination, Request, Response};
