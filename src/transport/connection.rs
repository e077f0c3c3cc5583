//! The event contract shared by central and peripheral connections.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::transport::{ChunkAccumulator, Error, Feed, LinkKind, StateCode};

/// Link level events surfaced to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A peer is reachable: the central found the service or a central
    /// connected to the peripheral.
    CanConnect,
    /// The GATT service is usable. For a peripheral, the central signalled
    /// that it is ready to transfer.
    ServiceConnected,
    /// The central confirmed the peripheral's identity value.
    PeerVerified,
    /// The first chunk of a multi-chunk message arrived.
    TransferInProgress,
    /// A full message was handed to the radio.
    TransferComplete,
    /// The peer wrote the end code to the state characteristic.
    TerminateRequested,
    Disconnected,
    NoDeviceFound,
    Error(String),
}

/// What a connection yields when polled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    Event(ConnectionEvent),
    /// A reassembled message. An empty message is a transport level
    /// termination signal.
    Message(Vec<u8>),
}

/// One end of a GATT link.
///
/// After [Connection::close] every method fails with [Error::Closed].
#[async_trait]
pub trait Connection: Send + Sync {
    fn kind(&self) -> LinkKind;

    /// Start advertising or scanning.
    async fn connect(&mut self) -> Result<(), Error>;

    /// Chunk and send one message.
    async fn send(&mut self, message: &[u8]) -> Result<(), Error>;

    /// Write a control code to the state characteristic.
    async fn signal(&mut self, code: StateCode) -> Result<(), Error>;

    /// Wait for the next event or message. Resolves with [Error::Closed] as
    /// soon as the connection is closed, including through a [CloseHandle].
    async fn next(&mut self) -> Result<Incoming, Error>;

    /// Release the radio. Fails with [Error::Closed] if already released.
    async fn close(&mut self) -> Result<(), Error>;

    /// Whether the connection was closed locally or through a handle.
    fn is_closed(&self) -> bool;

    fn close_handle(&self) -> CloseHandle;
}

/// Closes a connection from outside the task that owns it.
#[derive(Clone, Debug)]
pub struct CloseHandle(Arc<watch::Sender<bool>>);

/// Shared closed flag of a connection.
#[derive(Debug)]
pub(crate) struct ClosedFlag {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.0.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

impl ClosedFlag {
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub(crate) fn set(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.is_set() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Resolves once the flag is set.
    pub(crate) async fn wait(&mut self) {
        // The sender lives in `self`, so `wait_for` cannot fail.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn handle(&self) -> CloseHandle {
        CloseHandle(self.tx.clone())
    }
}

/// Feed one received chunk, reporting the start of a multi-chunk transfer.
pub(crate) fn receive_chunk(
    accumulator: &mut ChunkAccumulator,
    chunk: &[u8],
) -> Result<Option<Incoming>, Error> {
    let first = !accumulator.in_progress();
    match accumulator.feed(chunk)? {
        Feed::Complete(message) => Ok(Some(Incoming::Message(message))),
        Feed::Partial(_) if first => Ok(Some(Incoming::Event(
            ConnectionEvent::TransferInProgress,
        ))),
        Feed::Partial(_) => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn handle_wakes_waiter() {
        let mut flag = ClosedFlag::new();
        let handle = flag.handle();
        assert!(flag.check().is_ok());
        let closer = tokio::spawn(async move { handle.close() });
        flag.wait().await;
        closer.await.unwrap();
        assert!(matches!(flag.check(), Err(Error::Closed)));
    }

    #[test]
    fn transfer_in_progress_only_on_first_chunk() {
        let mut accumulator = ChunkAccumulator::new(Default::default());
        assert_eq!(
            receive_chunk(&mut accumulator, &[0x00, 1]).unwrap(),
            Some(Incoming::Event(ConnectionEvent::TransferInProgress))
        );
        assert_eq!(receive_chunk(&mut accumulator, &[0x00, 2]).unwrap(), None);
        assert_eq!(
            receive_chunk(&mut accumulator, &[0x01]).unwrap(),
            Some(Incoming::Message(vec![1, 2]))
        );
        assert_eq!(
            receive_chunk(&mut accumulator, &[0x01]).unwrap(),
            Some(Incoming::Message(vec![]))
        );
    }
}
