//! An in-process radio medium.
//!
//! Two [MemoryRadio] endpoints taken from one [MemoryMedium] behave like a
//! central and a peripheral sharing the air: advertising, scanning, GATT
//! writes and notifications are delivered as [RadioEvent]s to the other side.
//! The medium records every transmission and can be told to reject writes or
//! notifications to exercise backpressure handling.
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;
use uuid::Uuid;

use crate::transport::{
    CentralRadio, Characteristic, LinkKind, PeripheralRadio, RadioError, RadioEvent, RadioFactory,
};

#[derive(Clone, Debug, Default)]
pub struct MemoryMedium {
    state: Arc<Mutex<MediumState>>,
}

/// One GATT write or notification that crossed the medium.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmission {
    pub from: LinkKind,
    pub characteristic: Characteristic,
    pub value: Vec<u8>,
}

#[derive(Debug, Default)]
struct MediumState {
    central: Option<UnboundedSender<RadioEvent>>,
    peripheral: Option<UnboundedSender<RadioEvent>>,
    advertised: Option<Uuid>,
    ident: Option<Vec<u8>>,
    scanning: Option<Uuid>,
    connected: bool,
    subscriptions: HashSet<Characteristic>,
    reject_writes: u32,
    reject_notifies: u32,
    transmissions: Vec<Transmission>,
}

/// A device's radio on a [MemoryMedium].
#[derive(Clone, Debug)]
pub struct MemoryRadio {
    medium: MemoryMedium,
}

struct MemoryCentral {
    medium: MemoryMedium,
}

struct MemoryPeripheral {
    medium: MemoryMedium,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn radio(&self) -> MemoryRadio {
        MemoryRadio {
            medium: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MediumState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject the next `count` central writes with [RadioError::Rejected].
    pub fn reject_writes(&self, count: u32) {
        self.state().reject_writes = count;
    }

    /// Reject the next `count` peripheral notifications with
    /// [RadioError::Rejected].
    pub fn reject_notifies(&self, count: u32) {
        self.state().reject_notifies = count;
    }

    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state().transmissions.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// End a pending scan without a result.
    pub fn end_scan(&self) {
        let mut state = self.state();
        if state.scanning.take().is_some() {
            state.deliver(LinkKind::Central, RadioEvent::ScanTimedOut);
        }
    }

    /// Deliver an arbitrary radio event to one side.
    pub fn inject(&self, to: LinkKind, event: RadioEvent) {
        self.state().deliver(to, event);
    }
}

impl MediumState {
    fn deliver(&self, to: LinkKind, event: RadioEvent) {
        let sender = match to {
            LinkKind::Central => self.central.as_ref(),
            LinkKind::Peripheral => self.peripheral.as_ref(),
        };
        trace!(%to, ?event, "medium delivery");
        if let Some(sender) = sender {
            // A dropped receiver means that side has gone away.
            let _ = sender.send(event);
        }
    }

    fn drop_link(&mut self, from: LinkKind) {
        if self.connected {
            self.connected = false;
            self.subscriptions.clear();
            self.deliver(from.complement(), RadioEvent::Disconnected);
        }
    }

    fn take_rejection(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl RadioFactory for MemoryRadio {
    fn central(&self, events: UnboundedSender<RadioEvent>) -> Box<dyn CentralRadio> {
        self.medium.state().central = Some(events);
        Box::new(MemoryCentral {
            medium: self.medium.clone(),
        })
    }

    fn peripheral(&self, events: UnboundedSender<RadioEvent>) -> Box<dyn PeripheralRadio> {
        self.medium.state().peripheral = Some(events);
        Box::new(MemoryPeripheral {
            medium: self.medium.clone(),
        })
    }
}

#[async_trait]
impl CentralRadio for MemoryCentral {
    async fn scan(&self, service: Uuid) -> Result<(), RadioError> {
        let mut state = self.medium.state();
        if state.advertised == Some(service) {
            state.deliver(LinkKind::Central, RadioEvent::PeerFound);
        } else {
            state.scanning = Some(service);
        }
        Ok(())
    }

    async fn connect(&self) -> Result<(), RadioError> {
        let mut state = self.medium.state();
        if state.advertised.is_none() {
            return Err(RadioError::NotConnected);
        }
        state.scanning = None;
        state.connected = true;
        state.deliver(LinkKind::Peripheral, RadioEvent::Connected);
        state.deliver(LinkKind::Central, RadioEvent::Connected);
        state.deliver(LinkKind::Central, RadioEvent::ServicesDiscovered);
        Ok(())
    }

    async fn subscribe(&self, characteristic: Characteristic) -> Result<(), RadioError> {
        let mut state = self.medium.state();
        if !state.connected {
            return Err(RadioError::NotConnected);
        }
        state.subscriptions.insert(characteristic);
        Ok(())
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, RadioError> {
        let state = self.medium.state();
        if !state.connected {
            return Err(RadioError::NotConnected);
        }
        match characteristic {
            Characteristic::Ident => Ok(state.ident.clone().unwrap_or_default()),
            other => Err(RadioError::Failed(format!("{other:?} is not readable"))),
        }
    }

    async fn write(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), RadioError> {
        let mut state = self.medium.state();
        if MediumState::take_rejection(&mut state.reject_writes) {
            return Err(RadioError::Rejected);
        }
        if !state.connected {
            return Err(RadioError::NotConnected);
        }
        state.transmissions.push(Transmission {
            from: LinkKind::Central,
            characteristic,
            value: value.to_vec(),
        });
        state.deliver(
            LinkKind::Peripheral,
            RadioEvent::Written {
                characteristic,
                value: value.to_vec(),
            },
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        self.abort();
        Ok(())
    }

    fn abort(&self) {
        let mut state = self.medium.state();
        state.scanning = None;
        state.drop_link(LinkKind::Central);
    }
}

#[async_trait]
impl PeripheralRadio for MemoryPeripheral {
    async fn advertise(&self, service: Uuid, ident: Option<Vec<u8>>) -> Result<(), RadioError> {
        let mut state = self.medium.state();
        state.advertised = Some(service);
        state.ident = ident;
        if state.scanning == Some(service) {
            state.deliver(LinkKind::Central, RadioEvent::PeerFound);
        }
        Ok(())
    }

    async fn notify(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), RadioError> {
        let mut state = self.medium.state();
        if MediumState::take_rejection(&mut state.reject_notifies) {
            return Err(RadioError::Rejected);
        }
        if !state.connected {
            return Err(RadioError::NotConnected);
        }
        if !state.subscriptions.contains(&characteristic) {
            return Err(RadioError::Failed(format!(
                "central is not subscribed to {characteristic:?}"
            )));
        }
        state.transmissions.push(Transmission {
            from: LinkKind::Peripheral,
            characteristic,
            value: value.to_vec(),
        });
        state.deliver(
            LinkKind::Central,
            RadioEvent::Notified {
                characteristic,
                value: value.to_vec(),
            },
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        self.abort();
        Ok(())
    }

    fn abort(&self) {
        let mut state = self.medium.state();
        state.advertised = None;
        state.drop_link(LinkKind::Peripheral);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Role, SessionConfig, Topology};
    use crate::transport::{self, Connection, ConnectionEvent, Incoming, LinkSetup, StateCode};

    fn config(role: Role) -> SessionConfig {
        let mut config = SessionConfig::new(role, Topology::PeripheralServerMode, Uuid::nil());
        config.chunk_size = 4;
        config
    }

    fn open(medium: &MemoryMedium, role: Role, ident: [u8; 16]) -> Box<dyn Connection> {
        let setup = match role {
            Role::Holder => LinkSetup {
                ident: Some(ident.to_vec()),
                peer_identity: None,
            },
            Role::Verifier => LinkSetup {
                ident: None,
                peer_identity: Some(Box::new(ident)),
            },
        };
        transport::open(&config(role), &medium.radio(), setup).unwrap()
    }

    async fn next_event(connection: &mut Box<dyn Connection>) -> ConnectionEvent {
        match connection.next().await.unwrap() {
            Incoming::Event(event) => event,
            Incoming::Message(message) => panic!("unexpected message {message:?}"),
        }
    }

    #[tokio::test]
    async fn link_comes_up_and_carries_messages() {
        let medium = MemoryMedium::new();
        let mut holder = open(&medium, Role::Holder, [1; 16]);
        let mut verifier = open(&medium, Role::Verifier, [1; 16]);
        holder.connect().await.unwrap();
        verifier.connect().await.unwrap();

        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::CanConnect);
        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::ServiceConnected);
        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::PeerVerified);
        verifier.signal(StateCode::Start).await.unwrap();

        assert_eq!(next_event(&mut holder).await, ConnectionEvent::CanConnect);
        assert_eq!(next_event(&mut holder).await, ConnectionEvent::ServiceConnected);

        verifier.send(b"request bytes").await.unwrap();
        assert_eq!(next_event(&mut holder).await, ConnectionEvent::TransferInProgress);
        assert_eq!(
            holder.next().await.unwrap(),
            Incoming::Message(b"request bytes".to_vec())
        );

        medium.reject_notifies(2);
        holder.send(b"response").await.unwrap();
        assert_eq!(next_event(&mut holder).await, ConnectionEvent::TransferComplete);
        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::TransferComplete);
        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::TransferInProgress);
        assert_eq!(
            verifier.next().await.unwrap(),
            Incoming::Message(b"response".to_vec())
        );

        holder.close().await.unwrap();
        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::Disconnected);
        assert!(!medium.is_connected());
    }

    #[tokio::test]
    async fn wrong_ident_is_reported() {
        let medium = MemoryMedium::new();
        let mut holder = open(&medium, Role::Holder, [1; 16]);
        let mut verifier = open(&medium, Role::Verifier, [2; 16]);
        holder.connect().await.unwrap();
        verifier.connect().await.unwrap();
        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::CanConnect);
        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::ServiceConnected);
        assert!(matches!(
            next_event(&mut verifier).await,
            ConnectionEvent::Error(_)
        ));
    }

    #[tokio::test]
    async fn closed_connection_rejects_calls() {
        let medium = MemoryMedium::new();
        let mut holder = open(&medium, Role::Holder, [1; 16]);
        holder.close().await.unwrap();
        assert!(holder.is_closed());
        assert!(matches!(holder.connect().await, Err(transport::Error::Closed)));
        assert!(matches!(holder.send(b"x").await, Err(transport::Error::Closed)));
        assert!(matches!(holder.next().await, Err(transport::Error::Closed)));
        assert!(matches!(holder.close().await, Err(transport::Error::Closed)));
    }

    #[tokio::test]
    async fn close_handle_interrupts_waiting() {
        let medium = MemoryMedium::new();
        let mut holder = open(&medium, Role::Holder, [1; 16]);
        holder.connect().await.unwrap();
        let handle = holder.close_handle();
        let waiter = tokio::spawn(async move { holder.next().await });
        handle.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(transport::Error::Closed)
        ));
    }

    #[tokio::test]
    async fn scan_timeout_reports_no_device() {
        let medium = MemoryMedium::new();
        let mut verifier = open(&medium, Role::Verifier, [1; 16]);
        verifier.connect().await.unwrap();
        medium.end_scan();
        assert_eq!(next_event(&mut verifier).await, ConnectionEvent::NoDeviceFound);
    }
}
