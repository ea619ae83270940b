//! `netsync_shared`
//!
//! Shared libraries used by both the client session layer and the server.
//!
//! Design goals:
//! - One wire contract (named JSON envelopes in length-prefixed frames).
//! - Normalize inbound data once, at the deserialization boundary.
//! - Typed events instead of stringly-typed callbacks.
//! - No `unsafe`.

pub mod config;
pub mod event;
pub mod math;
pub mod net;
pub mod state;
pub mod status;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::state::*;
    pub use crate::status::*;
}
