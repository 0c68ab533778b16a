//! Ports module for the Security Manager

pub mod inbound;
pub mod outbound;

pub use inbound::{SecurityInfoListener, SecurityManagerApi};
pub use outbound::{
    CertificateAuthority, IssuanceError, PermissionManagement, PingProbe, ProbeError,
    RemoteCallError, SessionHandle, SessionTransport, TimeSource, TransportError,
};
