//! The scanning, connecting side of the link.
//!
//! The central writes outgoing chunks to `Client2Server` and receives
//! notifications on `Server2Client`. When given a [PeerIdentity] it reads the
//! peripheral's identity characteristic after service discovery and only
//! reports [ConnectionEvent::PeerVerified] on a match.
use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ChunkMarkers, RetryPolicy, SessionConfig};
use crate::transport::{
    chunk,
    connection::{self, ClosedFlag},
    CentralRadio, Characteristic, ChunkAccumulator, CloseHandle, Connection, ConnectionEvent,
    Error, Incoming, LinkKind, PeerIdentity, RadioEvent, StateCode,
};

pub struct CentralConnection {
    service: Uuid,
    payload_size: usize,
    markers: ChunkMarkers,
    retry: RetryPolicy,
    radio: Box<dyn CentralRadio>,
    events: UnboundedReceiver<RadioEvent>,
    peer_identity: Option<Box<dyn PeerIdentity>>,
    accumulator: ChunkAccumulator,
    pending: VecDeque<Incoming>,
    closed: ClosedFlag,
    released: bool,
}

impl CentralConnection {
    pub fn new(
        config: &SessionConfig,
        radio: Box<dyn CentralRadio>,
        events: UnboundedReceiver<RadioEvent>,
        peer_identity: Option<Box<dyn PeerIdentity>>,
    ) -> Self {
        Self {
            service: config.service_uuid,
            payload_size: config.chunk_payload_size(),
            markers: config.chunk_markers,
            retry: config.retry,
            radio,
            events,
            peer_identity,
            accumulator: ChunkAccumulator::new(config.chunk_markers),
            pending: VecDeque::new(),
            closed: ClosedFlag::new(),
            released: false,
        }
    }

    async fn write(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), Error> {
        let radio = self.radio.as_ref();
        chunk::write_with_retry(&self.retry, move || radio.write(characteristic, value)).await
    }

    async fn on_services_discovered(&mut self) -> Result<Incoming, Error> {
        self.radio.subscribe(Characteristic::State).await?;
        self.radio.subscribe(Characteristic::Server2Client).await?;
        if let Some(peer_identity) = &self.peer_identity {
            let ident = self.radio.read(Characteristic::Ident).await?;
            if peer_identity.verify(&ident) {
                info!("peripheral identity verified");
                self.pending
                    .push_back(Incoming::Event(ConnectionEvent::PeerVerified));
            } else {
                warn!("peripheral identity does not match the engagement");
                self.pending.push_back(Incoming::Event(ConnectionEvent::Error(
                    Error::IdentityMismatch.to_string(),
                )));
            }
        }
        Ok(Incoming::Event(ConnectionEvent::ServiceConnected))
    }

    async fn on_radio_event(&mut self, event: RadioEvent) -> Result<Option<Incoming>, Error> {
        let incoming = match event {
            RadioEvent::PeerFound => {
                debug!(service = %self.service, "peripheral found, connecting");
                self.radio.connect().await?;
                Some(Incoming::Event(ConnectionEvent::CanConnect))
            }
            RadioEvent::ScanTimedOut => Some(Incoming::Event(ConnectionEvent::NoDeviceFound)),
            RadioEvent::Connected => {
                debug!("link up, awaiting service discovery");
                None
            }
            RadioEvent::ServicesDiscovered => Some(self.on_services_discovered().await?),
            RadioEvent::Notified {
                characteristic: Characteristic::Server2Client,
                value,
            } => connection::receive_chunk(&mut self.accumulator, &value)?,
            RadioEvent::Notified {
                characteristic: Characteristic::State,
                value,
            } => match value.as_slice() {
                [code] if *code == StateCode::End as u8 => {
                    Some(Incoming::Event(ConnectionEvent::TerminateRequested))
                }
                other => {
                    debug!(?other, "ignoring state notification");
                    None
                }
            },
            RadioEvent::Disconnected => Some(Incoming::Event(ConnectionEvent::Disconnected)),
            RadioEvent::Failure(reason) => Some(Incoming::Event(ConnectionEvent::Error(reason))),
            other => {
                warn!(?other, "unexpected radio event for a central");
                None
            }
        };
        Ok(incoming)
    }
}

#[async_trait]
impl Connection for CentralConnection {
    fn kind(&self) -> LinkKind {
        LinkKind::Central
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.closed.check()?;
        info!(service = %self.service, "scanning");
        self.radio.scan(self.service).await?;
        Ok(())
    }

    async fn send(&mut self, message: &[u8]) -> Result<(), Error> {
        self.closed.check()?;
        let chunks = chunk::split(message, self.payload_size, self.markers)?;
        debug!(bytes = message.len(), chunks = chunks.len(), "sending message");
        for chunk in &chunks {
            self.write(Characteristic::Client2Server, chunk).await?;
        }
        self.pending
            .push_back(Incoming::Event(ConnectionEvent::TransferComplete));
        Ok(())
    }

    async fn signal(&mut self, code: StateCode) -> Result<(), Error> {
        self.closed.check()?;
        debug!(?code, "writing state");
        self.write(Characteristic::State, &[code as u8]).await
    }

    async fn next(&mut self) -> Result<Incoming, Error> {
        loop {
            self.closed.check()?;
            if let Some(incoming) = self.pending.pop_front() {
                return Ok(incoming);
            }
            let event = tokio::select! {
                _ = self.closed.wait() => return Err(Error::Closed),
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                return Ok(Incoming::Event(ConnectionEvent::Disconnected));
            };
            if let Some(incoming) = self.on_radio_event(event).await? {
                return Ok(incoming);
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.released {
            return Err(Error::Closed);
        }
        self.released = true;
        self.closed.set();
        self.accumulator.reset();
        info!("closing central connection");
        if let Err(e) = self.radio.disconnect().await {
            debug!(%e, "disconnect on close");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    fn close_handle(&self) -> CloseHandle {
        self.closed.handle()
    }
}

impl Drop for CentralConnection {
    fn drop(&mut self) {
        if !self.released {
            self.closed.set();
            self.radio.abort();
        }
    }
}
