use std::fmt;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::{Role, SessionConfig, Topology};
use crate::transport::{
    CentralConnection, Connection, Error, PeripheralConnection, RadioFactory,
};

/// The GATT side a device plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Central,
    Peripheral,
}

/// Local and remote link kinds for a (role, topology) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub local: LinkKind,
    pub remote: LinkKind,
}

/// How the central decides whether the peripheral it connected to is the
/// one named in device engagement.
pub trait PeerIdentity: Send + Sync {
    fn verify(&self, ident: &[u8]) -> bool;
}

impl PeerIdentity for [u8; 16] {
    fn verify(&self, ident: &[u8]) -> bool {
        self.as_slice() == ident
    }
}

/// The radio-independent inputs for building a connection.
pub struct LinkSetup {
    /// Value served on the identity characteristic when acting as peripheral.
    pub ident: Option<Vec<u8>>,
    /// Identity check performed when acting as central.
    pub peer_identity: Option<Box<dyn PeerIdentity>>,
}

pub fn resolve(role: Role, topology: Topology) -> Resolution {
    let local = match (role, topology) {
        (Role::Holder, Topology::CentralClientMode) => LinkKind::Central,
        (Role::Holder, Topology::PeripheralServerMode) => LinkKind::Peripheral,
        (Role::Verifier, Topology::CentralClientMode) => LinkKind::Peripheral,
        (Role::Verifier, Topology::PeripheralServerMode) => LinkKind::Central,
    };
    Resolution {
        local,
        remote: local.complement(),
    }
}

/// Resolve the local link kind and build the matching connection over
/// `radios`. Radio events flow to the returned connection over a fresh
/// channel.
pub fn open(
    config: &SessionConfig,
    radios: &dyn RadioFactory,
    setup: LinkSetup,
) -> Result<Box<dyn Connection>, Error> {
    config.validate()?;
    let resolution = resolve(config.role, config.topology);
    info!(
        role = ?config.role,
        topology = ?config.topology,
        local = %resolution.local,
        "resolved link roles"
    );
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connection: Box<dyn Connection> = match resolution.local {
        LinkKind::Central => Box::new(CentralConnection::new(
            config,
            radios.central(events_tx),
            events_rx,
            setup.peer_identity,
        )),
        LinkKind::Peripheral => Box::new(PeripheralConnection::new(
            config,
            radios.peripheral(events_tx),
            events_rx,
            setup.ident,
        )),
    };
    Ok(connection)
}

impl LinkKind {
    pub fn complement(self) -> Self {
        match self {
            LinkKind::Central => LinkKind::Peripheral,
            LinkKind::Peripheral => LinkKind::Central,
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Central => write!(f, "central"),
            LinkKind::Peripheral => write!(f, "peripheral"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decision_table() {
        let cases = [
            (Role::Holder, Topology::CentralClientMode, LinkKind::Central),
            (Role::Holder, Topology::PeripheralServerMode, LinkKind::Peripheral),
            (Role::Verifier, Topology::CentralClientMode, LinkKind::Peripheral),
            (Role::Verifier, Topology::PeripheralServerMode, LinkKind::Central),
        ];
        for (role, topology, local) in cases {
            let resolution = resolve(role, topology);
            assert_eq!(resolution.local, local, "{role:?} {topology:?}");
            assert_eq!(resolution.remote, local.complement());
        }
    }

    #[test]
    fn holder_and_verifier_are_complementary() {
        for topology in [Topology::CentralClientMode, Topology::PeripheralServerMode] {
            let holder = resolve(Role::Holder, topology);
            let verifier = resolve(Role::Verifier, topology);
            assert_eq!(holder.local, verifier.remote);
            assert_eq!(holder.remote, verifier.local);
        }
    }

    #[test]
    fn ident_check() {
        let expected = [7u8; 16];
        assert!(expected.verify(&[7u8; 16]));
        assert!(!expected.verify(&[7u8; 15]));
        assert!(!expected.verify(&[8u8; 16]));
    }
}
