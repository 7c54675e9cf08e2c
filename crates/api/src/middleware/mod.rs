//! Request extractors shared by the API handlers.
//!
//! - [`auth::RequireSecret`] -- Checks the `Authorization: Bearer` shared secret.
//! - [`peer::PeerAddr`] -- The remote address of the connection, when known.

pub mod auth;
pub mod peer;
