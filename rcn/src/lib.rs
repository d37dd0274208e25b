pub mod api;
pub mod api_client;
pub mod channel;
pub mod cluster;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod notify;
pub mod storage;
pub mod sync;
pub mod token;
pub mod utils;

/// Version of the node-to-control-plane protocol this build speaks.
pub const PROTOCOL_VERSION: &str = "1.11";

/// User agent presented on every outbound control-plane HTTP request.
pub fn user_agent() -> String {
    format!("rcn-cluster/{PROTOCOL_VERSION}")
}
