//! Adapters implementing the core client ports.

mod http_client;

pub use http_client::{HttpClient, HttpConnector};
