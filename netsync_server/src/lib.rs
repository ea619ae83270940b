//! `netsync_server`
//!
//! Reference session server:
//! - Admission with a waiting queue when full
//! - Server status replies
//! - Pose tracking and player list broadcast
//! - Administrative kick
//!
//! Transport: TCP with length-prefixed JSON frames (see `netsync_shared::net`).

pub mod server;

pub use server::{ServerHandle, SessionServer};
