//! Utilities for testing code that uses a [crate::client::connection::Connection] without a
//!  server: an in-memory transport, and a scripted server side for it.
//!
//! They are used for testing the client itself, but they are also exported for application
//!  testing, which is why this is regular (non-#[cfg(test)]) code.

pub mod transport;
