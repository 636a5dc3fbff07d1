//! Errors raised by the VF lifecycle and bridge managers.

use thiserror::Error;

use crate::netlink::LinkError;
use crate::netns::NsError;
use crate::sriov::MetadataError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A named device could not be resolved.
    #[error("failed to look up {role} link {name}: {error}")]
    LinkLookup {
        role: &'static str,
        name: String,
        error: LinkError,
    },

    /// A device-control call was rejected.
    #[error("failed to {action} {device}: {error}")]
    LinkOp {
        action: &'static str,
        device: String,
        error: LinkError,
    },

    #[error("failed to parse MAC address {mac:?}: {error}")]
    InvalidMac {
        mac: String,
        error: macaddr::ParseError,
    },

    #[error("failed to find vf {vf} on pf {pf}")]
    VfNotFound { pf: String, vf: u32 },

    #[error("interface name mismatch: container interface {container:?}, host interface {host:?}")]
    NameMismatch { container: String, host: String },

    #[error(transparent)]
    Namespace(#[from] NsError),

    /// Something failed after the VF was moved into the container namespace.
    #[error("error setting up interface in container namespace: {0}")]
    ContainerSetup(Box<Error>),

    #[error("failed to get VF {vf} representor on NIC {pf}: {error}")]
    Representor {
        pf: String,
        vf: u32,
        error: MetadataError,
    },
}

impl Error {
    /// True when a device lookup found nothing under the requested name.
    pub fn is_link_not_found(&self) -> bool {
        matches!(
            self,
            Error::LinkLookup {
                error: LinkError::NotFound(_),
                ..
            }
        )
    }

    pub(crate) fn lookup<'a>(
        role: &'static str,
        name: &'a str,
    ) -> impl FnOnce(LinkError) -> Self + 'a {
        move |error| Error::LinkLookup {
            role,
            name: name.to_string(),
            error,
        }
    }

    pub(crate) fn link_op<'a>(
        action: &'static str,
        device: &'a str,
    ) -> impl FnOnce(LinkError) -> Self + 'a {
        move |error| Error::LinkOp {
            action,
            device: device.to_string(),
            error,
        }
    }

    pub(crate) fn invalid_mac(mac: &str) -> impl FnOnce(macaddr::ParseError) -> Self + '_ {
        move |error| Error::InvalidMac {
            mac: mac.to_string(),
            error,
        }
    }
}
