//! Holder and verifier sides of a proximity presentment.
//!
//! [device::PresentmentEngine] answers requests on the holder; [reader::Verifier]
//! drives the exchange from the verifier. Both run over a
//! [Connection](crate::transport::Connection) and interpret its events through
//! the same [router::EventRouter].
pub mod collaborators;
pub mod device;
pub mod reader;
pub mod router;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::cbor::CborError;
use crate::config;
use crate::cose;
use crate::definitions::{device_engagement, device_signed, helpers::tag24, session};
use crate::transport;
use collaborators::KeyStoreError;

/// Error kinds surfaced by a presentment session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, raised before any radio activity.
    #[error("configuration error: {0}")]
    Configuration(#[from] config::Error),
    /// Radio connect, write or notify failure.
    #[error("transport error: {0}")]
    Transport(transport::Error),
    /// Decryption, authentication or key agreement failure. Always fatal.
    #[error("session crypto failure: {0}")]
    Crypto(String),
    /// Malformed or invalid message. Fatal for the session.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The key store needs an unlock that was not provided.
    #[error("the device key is locked")]
    KeyLocked,
    /// No credential matches a requested document type.
    #[error("no credential for document type '{0}'")]
    NoCredential(String),
    /// The connection was closed deliberately by the caller.
    #[error("transport closed")]
    TransportClosed,
}

/// Notifications to the application driving a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// The link is ready for transfer.
    Connected,
    /// The session is over, successfully or not.
    TransferComplete,
    /// The session failed.
    Error(String),
}

/// The application's notification channel. The application may stop
/// listening at any point.
#[derive(Clone, Debug)]
pub(crate) struct Notifier(UnboundedSender<Notification>);

impl Notifier {
    pub(crate) fn new(sender: UnboundedSender<Notification>) -> Self {
        Self(sender)
    }

    pub(crate) fn notify(&self, notification: Notification) {
        debug!(?notification, "notifying application");
        let _ = self.0.send(notification);
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        match e {
            transport::Error::Closed => Error::TransportClosed,
            transport::Error::Configuration(e) => Error::Configuration(e),
            other => Error::Transport(other),
        }
    }
}

impl From<session::Error> for Error {
    fn from(e: session::Error) -> Self {
        match e {
            session::Error::Cbor(_) | session::Error::Transcript(_) | session::Error::InvalidStatus(_) => {
                Error::Protocol(e.to_string())
            }
            other => Error::Crypto(other.to_string()),
        }
    }
}

impl From<device_signed::Error> for Error {
    fn from(e: device_signed::Error) -> Self {
        match e {
            device_signed::Error::Session(e) => e.into(),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<cose::Error> for Error {
    fn from(e: cose::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<CborError> for Error {
    fn from(e: CborError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<tag24::Error> for Error {
    fn from(e: tag24::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<KeyStoreError> for Error {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::Locked => Error::KeyLocked,
            other => Error::Crypto(other.to_string()),
        }
    }
}

impl From<device_engagement::Error> for Error {
    fn from(e: device_engagement::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
