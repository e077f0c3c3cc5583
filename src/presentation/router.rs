//! Interpretation of connection events for one (role, topology) pair.
//!
//! The handler is chosen once when the session is set up. The holder and
//! verifier tables mirror each other: whichever side is the central with an
//! identity check signals readiness after [ConnectionEvent::PeerVerified],
//! an unchecked central signals after [ConnectionEvent::ServiceConnected], and
//! a peripheral is connected once the central has signalled.
use tracing::{debug, info, warn};

use crate::config::{Role, Topology};
use crate::presentation::{Error, Notification, Notifier};
use crate::transport::{self, Connection, ConnectionEvent, LinkKind, StateCode};

/// What to do in response to a connection event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Ignore,
    /// Write the start code and report the link as connected.
    SignalReady,
    /// The peer signalled readiness; the link is connected.
    Connected,
    /// Write the end code and close.
    Terminate,
    /// The link went away.
    Closed,
    /// The link failed.
    Failed,
}

/// Where the link stands after applying a [Route].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkStatus {
    Pending,
    Connected,
    Finished,
}

type Handler = fn(&ConnectionEvent) -> Route;

#[derive(Clone, Copy)]
pub struct EventRouter {
    local: LinkKind,
    handler: Handler,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("local", &self.local)
            .finish()
    }
}

impl EventRouter {
    pub fn new(role: Role, topology: Topology) -> Self {
        let local = transport::resolve(role, topology).local;
        let handler: Handler = match (role, local) {
            (Role::Holder, LinkKind::Central) => holder_central,
            (Role::Holder, LinkKind::Peripheral) => holder_peripheral,
            (Role::Verifier, LinkKind::Central) => verifier_central,
            (Role::Verifier, LinkKind::Peripheral) => verifier_peripheral,
        };
        Self { local, handler }
    }

    pub fn local(&self) -> LinkKind {
        self.local
    }

    pub fn route(&self, event: &ConnectionEvent) -> Route {
        (self.handler)(event)
    }
}

fn link_lifecycle(event: &ConnectionEvent) -> Route {
    match event {
        ConnectionEvent::TerminateRequested => Route::Terminate,
        ConnectionEvent::Disconnected => Route::Closed,
        ConnectionEvent::Error(_) | ConnectionEvent::NoDeviceFound => Route::Failed,
        _ => Route::Ignore,
    }
}

fn holder_central(event: &ConnectionEvent) -> Route {
    match event {
        ConnectionEvent::ServiceConnected => Route::SignalReady,
        ConnectionEvent::PeerVerified => {
            warn!("holder central does not verify the verifier's identity");
            Route::Ignore
        }
        other => link_lifecycle(other),
    }
}

fn holder_peripheral(event: &ConnectionEvent) -> Route {
    match event {
        ConnectionEvent::ServiceConnected => Route::Connected,
        ConnectionEvent::PeerVerified => {
            warn!("peer verification reported to a holder peripheral");
            Route::Ignore
        }
        other => link_lifecycle(other),
    }
}

fn verifier_central(event: &ConnectionEvent) -> Route {
    match event {
        ConnectionEvent::ServiceConnected => Route::Ignore,
        ConnectionEvent::PeerVerified => Route::SignalReady,
        other => link_lifecycle(other),
    }
}

fn verifier_peripheral(event: &ConnectionEvent) -> Route {
    match event {
        ConnectionEvent::ServiceConnected => Route::Connected,
        other => link_lifecycle(other),
    }
}

/// Carry out `route` on `connection`.
pub(crate) async fn apply(
    route: Route,
    event: &ConnectionEvent,
    connection: &mut dyn Connection,
    notifier: &Notifier,
) -> Result<LinkStatus, Error> {
    match route {
        Route::Ignore => {
            debug!(?event, "ignoring connection event");
            Ok(LinkStatus::Pending)
        }
        Route::SignalReady => {
            connection.signal(StateCode::Start).await?;
            info!("signalled ready for transmission");
            notifier.notify(Notification::Connected);
            Ok(LinkStatus::Connected)
        }
        Route::Connected => {
            info!("peer is ready for transmission");
            notifier.notify(Notification::Connected);
            Ok(LinkStatus::Connected)
        }
        Route::Terminate => {
            info!("peer requested termination");
            if let Err(e) = connection.signal(StateCode::End).await {
                debug!(%e, "could not acknowledge termination");
            }
            connection.close().await?;
            notifier.notify(Notification::TransferComplete);
            Ok(LinkStatus::Finished)
        }
        Route::Closed => {
            info!("link closed by peer");
            notifier.notify(Notification::TransferComplete);
            connection.close().await?;
            Ok(LinkStatus::Finished)
        }
        Route::Failed => {
            let reason = match event {
                ConnectionEvent::Error(reason) => reason.clone(),
                other => format!("{other:?}"),
            };
            warn!(%reason, "link failed");
            notifier.notify(Notification::TransferComplete);
            if let Err(e) = connection.close().await {
                debug!(%e, "connection already released");
            }
            Err(Error::Transport(transport::Error::Link(reason)))
        }
    }
}
