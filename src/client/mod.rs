pub mod client_config;
pub mod client_error;
pub mod connection;
pub mod pending;
pub mod producer;
pub mod query_correlator;
pub mod registry;
pub mod response_correlator;
pub mod subscription;
