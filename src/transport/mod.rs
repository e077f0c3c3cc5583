//! The BLE link between holder and verifier.
//!
//! Platform radio stacks are abstracted behind [CentralRadio] and
//! [PeripheralRadio]. Radio callbacks are delivered as [RadioEvent]s on an
//! unbounded channel, so the platform thread never touches session state; the
//! [connection] objects drain that channel from the session's own task.
pub mod central;
pub mod chunk;
pub mod connection;
pub mod memory;
pub mod peripheral;
pub mod role;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use uuid::{uuid, Uuid};

use crate::config::{self, Topology};

pub use central::CentralConnection;
pub use chunk::{ChunkAccumulator, Feed};
pub use connection::{CloseHandle, Connection, ConnectionEvent, Incoming};
pub use peripheral::PeripheralConnection;
pub use role::{open, resolve, LinkKind, LinkSetup, PeerIdentity, Resolution};

/// The GATT characteristics of the mdoc service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Single byte control codes, see [StateCode].
    State,
    /// Written by the central.
    Client2Server,
    /// Notified by the peripheral.
    Server2Client,
    /// Read only identity value of the peripheral.
    Ident,
}

/// Control codes written to the [Characteristic::State] characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StateCode {
    Start = 0x01,
    End = 0x02,
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("write rejected by the radio stack (backpressure)")]
    Rejected,
    #[error("not connected")]
    NotConnected,
    #[error("radio failure: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection closed")]
    Closed,
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("write not accepted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("invalid chunk: {0}")]
    Framing(#[from] chunk::Error),
    #[error("peer identity does not match the engagement")]
    IdentityMismatch,
    #[error("link failure: {0}")]
    Link(String),
    #[error(transparent)]
    Configuration(#[from] config::Error),
}

/// Callbacks from the platform radio stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RadioEvent {
    /// A peripheral advertising the scanned service was found.
    PeerFound,
    /// Scanning stopped without finding the service.
    ScanTimedOut,
    /// The link is up.
    Connected,
    /// The central discovered the service characteristics.
    ServicesDiscovered,
    /// The remote central wrote to a characteristic of the local peripheral.
    Written {
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    /// The remote peripheral notified a subscribed characteristic.
    Notified {
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    Disconnected,
    Failure(String),
}

/// GATT client side of a platform radio.
#[async_trait]
pub trait CentralRadio: Send + Sync {
    /// Start scanning for a peripheral advertising `service`.
    async fn scan(&self, service: Uuid) -> Result<(), RadioError>;
    async fn connect(&self) -> Result<(), RadioError>;
    async fn subscribe(&self, characteristic: Characteristic) -> Result<(), RadioError>;
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, RadioError>;
    /// Write without response.
    async fn write(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), RadioError>;
    async fn disconnect(&self) -> Result<(), RadioError>;
    /// Tear the link down without waiting, used when a connection is dropped.
    fn abort(&self);
}

/// GATT server side of a platform radio.
#[async_trait]
pub trait PeripheralRadio: Send + Sync {
    /// Publish `service` and start advertising. `ident` is served from the
    /// [Characteristic::Ident] characteristic.
    async fn advertise(&self, service: Uuid, ident: Option<Vec<u8>>) -> Result<(), RadioError>;
    async fn notify(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), RadioError>;
    async fn disconnect(&self) -> Result<(), RadioError>;
    fn abort(&self);
}

/// Creates the radio half a resolved role needs, wired to an event channel.
pub trait RadioFactory {
    fn central(&self, events: UnboundedSender<RadioEvent>) -> Box<dyn CentralRadio>;
    fn peripheral(&self, events: UnboundedSender<RadioEvent>) -> Box<dyn PeripheralRadio>;
}

impl Characteristic {
    pub const ALL: [Characteristic; 4] = [
        Characteristic::State,
        Characteristic::Client2Server,
        Characteristic::Server2Client,
        Characteristic::Ident,
    ];

    /// The characteristic UUID. The mdoc service (peripheral server mode) and
    /// the mdoc reader service (central client mode) use distinct sets.
    pub fn uuid(&self, topology: Topology) -> Uuid {
        match (topology, self) {
            (Topology::PeripheralServerMode, Characteristic::State) => {
                uuid!("00000001-a123-48ce-896b-4c76973373e6")
            }
            (Topology::PeripheralServerMode, Characteristic::Client2Server) => {
                uuid!("00000002-a123-48ce-896b-4c76973373e6")
            }
            (Topology::PeripheralServerMode, Characteristic::Server2Client) => {
                uuid!("00000003-a123-48ce-896b-4c76973373e6")
            }
            (Topology::PeripheralServerMode, Characteristic::Ident) => {
                uuid!("00000004-a123-48ce-896b-4c76973373e6")
            }
            (Topology::CentralClientMode, Characteristic::State) => {
                uuid!("00000005-a123-48ce-896b-4c76973373e6")
            }
            (Topology::CentralClientMode, Characteristic::Client2Server) => {
                uuid!("00000006-a123-48ce-896b-4c76973373e6")
            }
            (Topology::CentralClientMode, Characteristic::Server2Client) => {
                uuid!("00000007-a123-48ce-896b-4c76973373e6")
            }
            (Topology::CentralClientMode, Characteristic::Ident) => {
                uuid!("00000008-a123-48ce-896b-4c76973373e6")
            }
        }
    }
}

impl TryFrom<u8> for StateCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        match code {
            0x01 => Ok(StateCode::Start),
            0x02 => Ok(StateCode::End),
            other => Err(other),
        }
    }
}
