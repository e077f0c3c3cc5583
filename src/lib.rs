pub mod cbor;
pub mod config;
pub mod cose;
pub mod definitions;
pub mod presentation;
pub mod transport;

pub use config::{Role, SessionConfig, Topology};
pub use presentation::{device::PresentmentEngine, reader::Verifier, Error, Notification};
