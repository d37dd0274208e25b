//! Types shared between the rcn edge node and the control plane.
//!
//! Both ends serialize the control channel messages with bincode and the
//! file manifest with gzip-compressed bincode, so the definitions live in
//! one crate rather than being duplicated on each side.

pub mod manifest;
pub mod protocol;

pub use manifest::{FileEntry, FileManifest, ManifestError};
pub use protocol::{
    AgentConfiguration, CertBundle, ControlReply, ControlRequest, EnableRequest, KeepAliveRequest,
    PortCheckRequest, SyncConfig,
};
