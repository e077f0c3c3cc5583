//! Verifier side of a proximity presentment.
//!
//! [SessionManager] holds the cryptographic session and knows nothing about
//! the radio: it turns requests into session messages and checks the holder's
//! responses. [Verifier] runs a [SessionManager] over a connection.
//!
//! ```ignore
//! let mut verifier = Verifier::new(config, &qr_code_uri, &radios, notifications)?;
//! verifier.connect().await?;
//! let response = verifier
//!     .request(&[("doc.A".to_string(), BTreeMap::from([("ns".to_string(), vec!["name".to_string()])]))])
//!     .await?;
//! ```
use std::collections::BTreeMap;

use ciborium::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cbor::{self, CborError};
use crate::config::{self, Role, SessionConfig, Topology};
use crate::definitions::{
    device_engagement::{self, DeviceEngagementBytes},
    device_response::{Errors, Status as ResponseStatus},
    device_signed,
    helpers::{tag24, NonEmptyMap, NonEmptyVec, Tag24},
    session, CoseKey, DeviceAuth, DeviceAuthType, DeviceAuthentication, DeviceEngagement,
    DeviceRequest, DeviceResponse, Direction, DocRequest, Document, EphemeralSecret, Handover,
    ItemsRequest, Mso, SessionCipher, SessionData, SessionEstablishment, SessionTranscript,
};
use crate::presentation::router::{self, EventRouter, LinkStatus};
use crate::presentation::{Error as PresentationError, Notification, Notifier};
use crate::transport::{
    self, CloseHandle, Connection, Incoming, LinkKind, LinkSetup, RadioFactory, StateCode,
};

/// Requested element identifiers per namespace.
pub type RequestedElements = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the qr code had the wrong prefix or the contained data could not be decoded: {0}")]
    InvalidQrCode(#[from] device_engagement::Error),
    #[error("session failure: {0}")]
    Session(#[from] session::Error),
    #[error("unable to encode or decode a message: {0}")]
    Cbor(#[from] CborError),
    #[error("unable to encode an embedded data item: {0}")]
    Tag24(#[from] tag24::Error),
    #[error("unable to compute device authentication: {0}")]
    DeviceSigned(#[from] device_signed::Error),
    #[error("request for data is invalid: {0}")]
    InvalidRequest(String),
    #[error("holder responded with status {0:?}")]
    HolderError(session::Status),
    #[error("holder ended the session without a response")]
    TerminatedByHolder,
    #[error("session data carries neither data nor status")]
    EmptySessionData,
    #[error("failed mdoc authentication for '{doc_type}': {reason}")]
    MdocAuth { doc_type: String, reason: String },
}

/// The holder's response after every check passed.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedResponse {
    pub documents: Vec<ValidatedDocument>,
    /// Document types the holder did not return.
    pub document_errors: Vec<String>,
    pub status: ResponseStatus,
    /// The holder ended the session with this response.
    pub terminated: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedDocument {
    pub doc_type: String,
    /// Disclosed element values per namespace.
    pub elements: BTreeMap<String, BTreeMap<String, Value>>,
    pub device_auth: DeviceAuthType,
    /// Requested elements the holder reported as not returned.
    pub errors: Option<Errors>,
}

/// The verifier's cryptographic session with one holder.
pub struct SessionManager {
    engagement: DeviceEngagementBytes,
    e_reader_key: EphemeralSecret,
    transcript: SessionTranscript,
    cipher: SessionCipher,
    issuer_key: Option<CoseKey>,
    established: bool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("established", &self.established)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Start a session from the holder's `mdoc:` engagement URI.
    pub fn establish(qr_code_uri: &str) -> Result<Self, Error> {
        let engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(qr_code_uri)?;
        let e_device_key = engagement.as_ref().e_device_key().as_ref();
        let e_reader_key = EphemeralSecret::generate(e_device_key.curve())?;
        let transcript = SessionTranscript(
            engagement.clone(),
            Tag24::new(e_reader_key.public_key())?,
            Handover::QR,
        );
        let cipher = SessionCipher::derive(&e_reader_key, e_device_key, &transcript)?;
        debug!(curve = ?e_reader_key.curve(), "reader session keys derived");
        Ok(Self {
            engagement,
            e_reader_key,
            transcript,
            cipher,
            issuer_key: None,
            established: false,
        })
    }

    /// Also verify each document's `issuerAuth` signature against `key`.
    pub fn with_issuer_key(mut self, key: CoseKey) -> Self {
        self.issuer_key = Some(key);
        self
    }

    pub fn engagement(&self) -> &DeviceEngagementBytes {
        &self.engagement
    }

    pub fn transcript(&self) -> &SessionTranscript {
        &self.transcript
    }

    /// The value the holder must serve on the identity characteristic.
    pub fn ble_ident(&self) -> Result<[u8; 16], Error> {
        Ok(device_engagement::ble_ident(
            self.engagement.as_ref().e_device_key(),
        )?)
    }

    /// The service UUID the engagement offers for `topology`.
    pub fn service_uuid(&self, topology: Topology) -> Option<Uuid> {
        let options = self.engagement.as_ref().ble_options()?;
        match topology {
            Topology::PeripheralServerMode => {
                options.peripheral_server_mode.as_ref().map(|mode| mode.uuid)
            }
            Topology::CentralClientMode => options.central_client_mode.as_ref().map(|mode| mode.uuid),
        }
    }

    /// Encode a request for `documents`, in order. The first request of a
    /// session travels in the [SessionEstablishment].
    pub fn new_request(&mut self, documents: &[(String, RequestedElements)]) -> Result<Vec<u8>, Error> {
        let doc_requests = documents
            .iter()
            .map(|(doc_type, elements)| doc_request(doc_type, elements))
            .collect::<Result<Vec<_>, _>>()?;
        let doc_requests = NonEmptyVec::maybe_new(doc_requests)
            .ok_or_else(|| Error::InvalidRequest("no documents requested".into()))?;
        let request = cbor::to_vec(&DeviceRequest {
            version: DeviceRequest::VERSION.into(),
            doc_requests,
        })?;
        if self.established {
            return Ok(self
                .cipher
                .seal(Direction::ReaderToDevice, Some(&request), None)?);
        }
        let data = self.cipher.encrypt(Direction::ReaderToDevice, &request)?;
        self.established = true;
        Ok(cbor::to_vec(&SessionEstablishment {
            e_reader_key: self.transcript.1.clone(),
            data: data.into(),
        })?)
    }

    /// Decrypt and check a response message.
    pub fn handle_response(&mut self, message: &[u8]) -> Result<ValidatedResponse, Error> {
        let session_data: SessionData = cbor::from_slice(message)?;
        let (plaintext, status) = self.cipher.open(Direction::DeviceToReader, &session_data)?;
        let terminated = match status {
            None => false,
            Some(session::Status::SessionTermination) => true,
            Some(error) => return Err(Error::HolderError(error)),
        };
        let plaintext = match plaintext {
            Some(plaintext) => plaintext,
            None if terminated => return Err(Error::TerminatedByHolder),
            None => return Err(Error::EmptySessionData),
        };
        let response: DeviceResponse = cbor::from_slice(&plaintext)?;

        let documents = response
            .documents
            .map(NonEmptyVec::into_inner)
            .unwrap_or_default()
            .into_iter()
            .map(|document| self.validate_document(document))
            .collect::<Result<Vec<_>, _>>()?;
        let document_errors = response
            .document_errors
            .map(NonEmptyVec::into_inner)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|errors| errors.into_keys())
            .collect();
        info!(
            documents = documents.len(),
            terminated, "validated device response"
        );
        Ok(ValidatedResponse {
            documents,
            document_errors,
            status: response.status,
            terminated,
        })
    }

    /// A [SessionData] carrying only the termination status.
    pub fn terminate(&mut self) -> Result<Vec<u8>, Error> {
        Ok(self
            .cipher
            .seal(Direction::ReaderToDevice, None, Some(session::Status::SessionTermination))?)
    }

    fn validate_document(&self, document: Document) -> Result<ValidatedDocument, Error> {
        let fail = |reason: String| Error::MdocAuth {
            doc_type: document.doc_type.clone(),
            reason,
        };

        let issuer_auth = &document.issuer_signed.issuer_auth;
        let payload = issuer_auth
            .payload()
            .ok_or_else(|| fail("issuerAuth carries no MSO".into()))?;
        let mso = Mso::from_payload(payload).map_err(|e| fail(e.to_string()))?;
        if mso.doc_type != document.doc_type {
            return Err(fail(format!("MSO is for '{}'", mso.doc_type)));
        }
        if !mso.validity_info.is_valid_at(OffsetDateTime::now_utc()) {
            return Err(fail("credential is outside its validity window".into()));
        }
        if let Some(issuer_key) = &self.issuer_key {
            issuer_auth
                .verify(issuer_key)
                .map_err(|e| fail(format!("issuer signature: {e}")))?;
        }

        let mut elements: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for (namespace, items) in document.issuer_signed.namespaces.iter().flat_map(|n| n.iter()) {
            for item in items.iter() {
                let element = item.as_ref();
                if !item.matches_digest(namespace, &mso) {
                    return Err(fail(format!(
                        "digest mismatch for {namespace}/{}",
                        element.element_identifier
                    )));
                }
                elements
                    .entry(namespace.clone())
                    .or_default()
                    .insert(element.element_identifier.clone(), element.element_value.clone());
            }
        }

        let device_auth_bytes = DeviceAuthentication::new(
            self.transcript.clone(),
            document.doc_type.clone(),
            document.device_signed.namespaces.clone(),
        )
        .to_bytes()?;
        let device_key = &mso.device_key_info.device_key;
        let device_auth = &document.device_signed.device_auth;
        match device_auth {
            DeviceAuth::DeviceSignature(signature) => signature
                .verify_detached(&device_auth_bytes, device_key)
                .map_err(|e| fail(format!("device signature: {e}")))?,
            DeviceAuth::DeviceMac(mac) => {
                let shared_secret = self.e_reader_key.agree(device_key)?;
                let key = device_signed::emac_key(&shared_secret, &self.transcript)?;
                mac.verify_detached(&key, &device_auth_bytes)
                    .map_err(|e| fail(format!("device MAC: {e}")))?
            }
        }

        Ok(ValidatedDocument {
            device_auth: device_auth.auth_type(),
            doc_type: document.doc_type,
            elements,
            errors: document.errors,
        })
    }
}

fn doc_request(doc_type: &str, elements: &RequestedElements) -> Result<DocRequest, Error> {
    let namespaces = elements
        .iter()
        .filter_map(|(namespace, identifiers)| {
            let identifiers = identifiers
                .iter()
                .map(|identifier| (identifier.clone(), false))
                .collect();
            NonEmptyMap::maybe_new(identifiers).map(|identifiers| (namespace.clone(), identifiers))
        })
        .collect();
    let namespaces = NonEmptyMap::maybe_new(namespaces)
        .ok_or_else(|| Error::InvalidRequest(format!("no elements requested from '{doc_type}'")))?;
    Ok(DocRequest {
        items_request: Tag24::new(ItemsRequest {
            doc_type: doc_type.to_string(),
            namespaces,
            request_info: None,
        })?,
        reader_auth: None,
    })
}

impl From<Error> for PresentationError {
    fn from(e: Error) -> Self {
        match e {
            Error::Session(e) => e.into(),
            Error::DeviceSigned(e) => e.into(),
            Error::MdocAuth { .. } => PresentationError::Crypto(e.to_string()),
            other => PresentationError::Protocol(other.to_string()),
        }
    }
}

/// Runs a verifier session over a connection.
pub struct Verifier {
    session: SessionManager,
    router: EventRouter,
    connection: Box<dyn Connection>,
    notifier: Notifier,
}

impl Verifier {
    /// Establish the session from the holder's engagement and open the
    /// connection. The service UUID comes from the engagement, not from
    /// `config`.
    pub fn new(
        mut config: SessionConfig,
        qr_code_uri: &str,
        radios: &dyn RadioFactory,
        notifications: UnboundedSender<Notification>,
    ) -> Result<Self, PresentationError> {
        config.validate()?;
        if config.role != Role::Verifier {
            return Err(config::Error::WrongRole(config.role).into());
        }
        let session = SessionManager::establish(qr_code_uri)?;
        config.service_uuid = session.service_uuid(config.topology).ok_or_else(|| {
            PresentationError::Protocol(format!(
                "engagement does not offer {}",
                config.topology.as_ref()
            ))
        })?;
        let ident = session.ble_ident()?;
        let setup = match transport::resolve(config.role, config.topology).local {
            LinkKind::Central => LinkSetup {
                ident: None,
                peer_identity: Some(Box::new(ident)),
            },
            LinkKind::Peripheral => LinkSetup {
                ident: Some(ident.to_vec()),
                peer_identity: None,
            },
        };
        let connection = transport::open(&config, radios, setup)?;
        Ok(Self {
            session,
            router: EventRouter::new(config.role, config.topology),
            connection,
            notifier: Notifier::new(notifications),
        })
    }

    /// Verify each document's `issuerAuth` against `key`.
    pub fn with_issuer_key(mut self, key: CoseKey) -> Self {
        self.session = self.session.with_issuer_key(key);
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.connection.close_handle()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Bring the link up to the point where requests can be sent.
    pub async fn connect(&mut self) -> Result<(), PresentationError> {
        let result = self.await_connection().await;
        self.settle(result).await
    }

    /// Send one request and wait for its validated response. The connection
    /// is closed when the holder ends the session with the response.
    pub async fn request(
        &mut self,
        documents: &[(String, RequestedElements)],
    ) -> Result<ValidatedResponse, PresentationError> {
        let result = self.exchange(documents).await;
        self.settle(result).await
    }

    /// Tell the holder the session is over and close the connection.
    pub async fn terminate(&mut self) -> Result<(), PresentationError> {
        let message = self.session.terminate()?;
        self.connection.send(&message).await?;
        if let Err(e) = self.connection.signal(StateCode::End).await {
            debug!(%e, "could not signal termination");
        }
        self.connection.close().await?;
        info!("verifier terminated the session");
        self.notifier.notify(Notification::TransferComplete);
        Ok(())
    }

    async fn await_connection(&mut self) -> Result<(), PresentationError> {
        self.connection.connect().await?;
        loop {
            match self.connection.next().await? {
                Incoming::Event(event) => {
                    let route = self.router.route(&event);
                    match router::apply(route, &event, self.connection.as_mut(), &self.notifier)
                        .await?
                    {
                        LinkStatus::Pending => {}
                        LinkStatus::Connected => return Ok(()),
                        LinkStatus::Finished => {
                            return Err(PresentationError::Transport(transport::Error::Link(
                                "link closed before it was ready".into(),
                            )))
                        }
                    }
                }
                Incoming::Message(_) => {
                    return Err(PresentationError::Protocol(
                        "message received before the link was ready".into(),
                    ))
                }
            }
        }
    }

    async fn exchange(
        &mut self,
        documents: &[(String, RequestedElements)],
    ) -> Result<ValidatedResponse, PresentationError> {
        let message = self.session.new_request(documents)?;
        self.connection.send(&message).await?;
        debug!(documents = documents.len(), "device request sent");
        let message = loop {
            match self.connection.next().await? {
                Incoming::Message(message) if message.is_empty() => {
                    return Err(Error::TerminatedByHolder.into())
                }
                Incoming::Message(message) => break message,
                Incoming::Event(event) => {
                    let route = self.router.route(&event);
                    let status =
                        router::apply(route, &event, self.connection.as_mut(), &self.notifier)
                            .await?;
                    if status == LinkStatus::Finished {
                        return Err(PresentationError::Transport(transport::Error::Link(
                            "link closed before a response arrived".into(),
                        )));
                    }
                }
            }
        };
        let response = self.session.handle_response(&message)?;
        if response.terminated {
            info!("holder ended the session with its response");
            self.connection.close().await?;
            self.notifier.notify(Notification::TransferComplete);
        }
        Ok(response)
    }

    /// Close the connection and report any failure other than a deliberate
    /// close.
    async fn settle<T>(
        &mut self,
        result: Result<T, PresentationError>,
    ) -> Result<T, PresentationError> {
        match result {
            Err(PresentationError::TransportClosed) => Err(PresentationError::TransportClosed),
            Err(e) => {
                warn!(%e, "verifier session failed");
                if let Err(close) = self.connection.close().await {
                    debug!(%close, "connection already released");
                }
                self.notifier.notify(Notification::Error(e.to_string()));
                Err(e)
            }
            ok => ok,
        }
    }
}
