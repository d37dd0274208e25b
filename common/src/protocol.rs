use serde::{Deserialize, Serialize};

/// Requests the node sends over the persistent control channel. One
/// bidirectional stream carries one request and its reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    /// First message on every fresh connection; authenticates the session.
    Hello { token: String },
    Enable(EnableRequest),
    Disable,
    PortCheck(PortCheckRequest),
    RequestCert,
    KeepAlive(KeepAliveRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlReply {
    Ack(bool),
    Err(String),
    Cert(CertBundle),
    /// A missing server timestamp means the control plane has removed this
    /// node and it must re-register from scratch.
    KeepAliveAck { server_time: Option<i64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableRequest {
    pub host: Option<String>,
    pub port: u16,
    pub version: String,
    pub byoc: bool,
    pub no_fast_enable: bool,
    pub flavor: NodeFlavor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortCheckRequest {
    pub host: Option<String>,
    pub port: u16,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    /// Unix millis at which the node captured the counter snapshot.
    pub time: i64,
    pub hits: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertBundle {
    pub cert: String,
    pub key: String,
}

/// Runtime/storage label pair reported when registering, so the control
/// plane can tell node builds apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFlavor {
    pub runtime: String,
    pub storage: String,
}

/// Sync tuning handed out by `GET configuration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfiguration {
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source: String,
    pub concurrency: usize,
}
