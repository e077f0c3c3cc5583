//! The advertising side of the link.
//!
//! The peripheral serves the identity characteristic, receives chunks written
//! by the central to `Client2Server` and sends its own chunks as
//! `Server2Client` notifications. The central writing the start code to the
//! state characteristic is reported as [ConnectionEvent::ServiceConnected].
use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ChunkMarkers, RetryPolicy, SessionConfig};
use crate::transport::{
    chunk,
    connection::{self, ClosedFlag},
    Characteristic, ChunkAccumulator, CloseHandle, Connection, ConnectionEvent, Error, Incoming,
    LinkKind, PeripheralRadio, RadioEvent, StateCode,
};

pub struct PeripheralConnection {
    service: Uuid,
    ident: Option<Vec<u8>>,
    payload_size: usize,
    markers: ChunkMarkers,
    retry: RetryPolicy,
    radio: Box<dyn PeripheralRadio>,
    events: UnboundedReceiver<RadioEvent>,
    accumulator: ChunkAccumulator,
    pending: VecDeque<Incoming>,
    closed: ClosedFlag,
    released: bool,
}

impl PeripheralConnection {
    pub fn new(
        config: &SessionConfig,
        radio: Box<dyn PeripheralRadio>,
        events: UnboundedReceiver<RadioEvent>,
        ident: Option<Vec<u8>>,
    ) -> Self {
        Self {
            service: config.service_uuid,
            ident,
            payload_size: config.chunk_payload_size(),
            markers: config.chunk_markers,
            retry: config.retry,
            radio,
            events,
            accumulator: ChunkAccumulator::new(config.chunk_markers),
            pending: VecDeque::new(),
            closed: ClosedFlag::new(),
            released: false,
        }
    }

    async fn notify(&self, characteristic: Characteristic, value: &[u8]) -> Result<(), Error> {
        let radio = self.radio.as_ref();
        chunk::write_with_retry(&self.retry, move || radio.notify(characteristic, value)).await
    }

    fn on_radio_event(&mut self, event: RadioEvent) -> Result<Option<Incoming>, Error> {
        let incoming = match event {
            RadioEvent::Connected => {
                debug!("central connected");
                Some(Incoming::Event(ConnectionEvent::CanConnect))
            }
            RadioEvent::Written {
                characteristic: Characteristic::Client2Server,
                value,
            } => connection::receive_chunk(&mut self.accumulator, &value)?,
            RadioEvent::Written {
                characteristic: Characteristic::State,
                value,
            } => match value.as_slice().first().copied().map(StateCode::try_from) {
                Some(Ok(StateCode::Start)) => {
                    info!("central is ready for transmission");
                    Some(Incoming::Event(ConnectionEvent::ServiceConnected))
                }
                Some(Ok(StateCode::End)) => {
                    Some(Incoming::Event(ConnectionEvent::TerminateRequested))
                }
                _ => {
                    warn!(?value, "ignoring unknown state write");
                    None
                }
            },
            RadioEvent::Disconnected => Some(Incoming::Event(ConnectionEvent::Disconnected)),
            RadioEvent::Failure(reason) => Some(Incoming::Event(ConnectionEvent::Error(reason))),
            other => {
                warn!(?other, "unexpected radio event for a peripheral");
                None
            }
        };
        Ok(incoming)
    }
}

#[async_trait]
impl Connection for PeripheralConnection {
    fn kind(&self) -> LinkKind {
        LinkKind::Peripheral
    }

    async fn connect(&mut self) -> Result<(), Error> {
        self.closed.check()?;
        info!(service = %self.service, "advertising");
        self.radio.advertise(self.service, self.ident.clone()).await?;
        Ok(())
    }

    async fn send(&mut self, message: &[u8]) -> Result<(), Error> {
        self.closed.check()?;
        let chunks = chunk::split(message, self.payload_size, self.markers)?;
        debug!(bytes = message.len(), chunks = chunks.len(), "sending message");
        for chunk in &chunks {
            self.notify(Characteristic::Server2Client, chunk).await?;
        }
        self.pending
            .push_back(Incoming::Event(ConnectionEvent::TransferComplete));
        Ok(())
    }

    async fn signal(&mut self, code: StateCode) -> Result<(), Error> {
        self.closed.check()?;
        debug!(?code, "notifying state");
        self.notify(Characteristic::State, &[code as u8]).await
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
            if let Some(incoming) = self.on_radio_event(event)? {
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
        info!("closing peripheral connection");
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

impl Drop for PeripheralConnection {
    fn drop(&mut self) {
        if !self.released {
            self.closed.set();
            self.radio.abort();
        }
    }
}
