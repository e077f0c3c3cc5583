//! Holder side of a proximity presentment.
//!
//! A [PresentmentEngine] owns the holder's ephemeral key, the device
//! engagement derived from it and one connection. [PresentmentEngine::run]
//! drives the session as a single task:
//!
//! ```text
//! AwaitingConnection -> AwaitingRequest -> Decrypting -> Parsing
//!   -> SelectingCredentials -> AwaitingConsent -> BuildingResponse
//!   -> SendingResponse -> (AwaitingRequest | Terminated) | Error
//! ```
//!
//! The engine suspends only while waiting on the connection, so dropping the
//! `run` future or closing through [PresentmentEngine::close_handle] stops it
//! and releases the radio.
use std::collections::BTreeMap;
use std::future::Future;

use tokio::sync::{mpsc::UnboundedSender, watch};
use tracing::{debug, error, info, warn};

use crate::cbor;
use crate::config::{self, Role, SessionConfig, Topology};
use crate::cose::{CoseMac0, PreparedCoseSign1};
use crate::definitions::{
    device_engagement::{self, DeviceEngagementBytes},
    device_response::{DocumentError, DocumentErrorCode, Status as ResponseStatus},
    device_signed,
    helpers::{NonEmptyVec, Tag24},
    session, BleOptions, CentralClientMode, CoseKey, DeviceAuth, DeviceAuthentication,
    DeviceEngagement, DeviceRequest, DeviceResponse, DeviceSigned, Direction, Document, EC2Curve,
    EphemeralSecret, Handover, PeripheralServerMode, SessionCipher, SessionData,
    SessionEstablishment, SessionTranscript,
};
use crate::presentation::collaborators::{
    Collaborators, Credential, KeySession, KeyStoreError, RequestedDocument,
};
use crate::presentation::router::{self, EventRouter, LinkStatus};
use crate::presentation::{Error, Notification, Notifier};
use crate::transport::{self, CloseHandle, Connection, Incoming, LinkSetup, RadioFactory};

/// Where the holder's session stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    AwaitingConnection,
    AwaitingRequest,
    Decrypting,
    Parsing,
    SelectingCredentials,
    AwaitingConsent,
    BuildingResponse,
    SendingResponse,
    Terminated,
    Error,
}

/// How a session that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The session reached [State::Terminated].
    Completed,
    /// The application closed the connection.
    Cancelled,
}

struct Session {
    e_reader_key: CoseKey,
    transcript: SessionTranscript,
    cipher: SessionCipher,
}

pub struct PresentmentEngine {
    config: SessionConfig,
    router: EventRouter,
    connection: Box<dyn Connection>,
    collaborators: Collaborators,
    notifier: Notifier,
    e_device_key: EphemeralSecret,
    engagement: DeviceEngagementBytes,
    session: Option<Session>,
    state: watch::Sender<State>,
}

impl PresentmentEngine {
    /// Generate the ephemeral device key and engagement and open the
    /// connection for the configured topology. No radio activity starts
    /// before [PresentmentEngine::run].
    pub fn new(
        config: SessionConfig,
        radios: &dyn RadioFactory,
        collaborators: Collaborators,
        notifications: UnboundedSender<Notification>,
    ) -> Result<Self, Error> {
        config.validate()?;
        if config.role != Role::Holder {
            return Err(config::Error::WrongRole(config.role).into());
        }
        let e_device_key = EphemeralSecret::generate(EC2Curve::P256)?;
        let e_device_key_bytes = Tag24::new(e_device_key.public_key())?;
        let ident = device_engagement::ble_ident(&e_device_key_bytes)?;
        let engagement = Tag24::new(DeviceEngagement::new(
            e_device_key_bytes,
            ble_options(config.topology, config.service_uuid),
        ))?;
        let connection = transport::open(
            &config,
            radios,
            LinkSetup {
                ident: Some(ident.to_vec()),
                peer_identity: None,
            },
        )?;
        let (state, _) = watch::channel(State::AwaitingConnection);
        Ok(Self {
            router: EventRouter::new(config.role, config.topology),
            config,
            connection,
            collaborators,
            notifier: Notifier::new(notifications),
            e_device_key,
            engagement,
            session: None,
            state,
        })
    }

    pub fn engagement(&self) -> &DeviceEngagementBytes {
        &self.engagement
    }

    /// The engagement as an `mdoc:` URI for a QR code.
    pub fn qr_code_uri(&self) -> String {
        self.engagement.to_qr_code_uri()
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.connection.close_handle()
    }

    pub fn states(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Run the session to completion.
    ///
    /// A close through the [CloseHandle] ends the session with
    /// [Outcome::Cancelled]. Any other failure moves to [State::Error],
    /// closes the connection and is reported to the application before it is
    /// returned.
    pub async fn run(mut self) -> Result<Outcome, Error> {
        match self.drive().await {
            Ok(()) => Ok(Outcome::Completed),
            Err(Error::TransportClosed) => {
                info!("session closed by the application");
                self.set_state(State::Terminated);
                self.release().await;
                self.notifier.notify(Notification::TransferComplete);
                Ok(Outcome::Cancelled)
            }
            Err(e) => {
                error!(%e, "presentment failed");
                self.set_state(State::Error);
                self.release().await;
                self.notifier.notify(Notification::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn set_state(&self, state: State) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "holder state transition");
        }
    }

    async fn release(&mut self) {
        if let Err(e) = self.connection.close().await {
            debug!(%e, "connection already released");
        }
    }

    async fn drive(&mut self) -> Result<(), Error> {
        self.set_state(State::AwaitingConnection);
        self.connection.connect().await?;
        if self.await_connection().await? == LinkStatus::Finished {
            self.set_state(State::Terminated);
            return Ok(());
        }
        loop {
            self.set_state(State::AwaitingRequest);
            let Some(message) = self.await_message().await? else {
                self.set_state(State::Terminated);
                return Ok(());
            };
            if message.is_empty() {
                info!("received transport termination");
                return self.terminate().await;
            }

            self.set_state(State::Decrypting);
            let (plaintext, status) = self.decrypt(&message)?;

            self.set_state(State::Parsing);
            match status {
                Some(session::Status::SessionTermination) => {
                    info!("verifier terminated the session");
                    return self.terminate().await;
                }
                Some(other) => {
                    return Err(Error::Protocol(format!("verifier reported {other:?}")));
                }
                None => {}
            }
            let plaintext = plaintext.ok_or_else(|| {
                Error::Protocol("session data carries neither data nor status".into())
            })?;
            let request = parse_request(&plaintext)?;
            info!(documents = request.doc_requests.len(), "received device request");

            let response = self.respond(&request).await;

            self.set_state(State::SendingResponse);
            self.send_response(&response).await?;
            if !self.config.allow_multiple_requests {
                return self.terminate().await;
            }
        }
    }

    async fn await_connection(&mut self) -> Result<LinkStatus, Error> {
        loop {
            match self.connection.next().await? {
                Incoming::Event(event) => {
                    let route = self.router.route(&event);
                    let status =
                        router::apply(route, &event, self.connection.as_mut(), &self.notifier)
                            .await?;
                    if status != LinkStatus::Pending {
                        return Ok(status);
                    }
                }
                Incoming::Message(_) => {
                    return Err(Error::Protocol(
                        "message received before the link was ready".into(),
                    ))
                }
            }
        }
    }

    /// The next message, or `None` once the link has finished.
    async fn await_message(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            match self.connection.next().await? {
                Incoming::Message(message) => return Ok(Some(message)),
                Incoming::Event(event) => {
                    let route = self.router.route(&event);
                    let status =
                        router::apply(route, &event, self.connection.as_mut(), &self.notifier)
                            .await?;
                    if status == LinkStatus::Finished {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), Error> {
        self.set_state(State::Terminated);
        self.connection.close().await?;
        self.notifier.notify(Notification::TransferComplete);
        Ok(())
    }

    /// The first message establishes the session keys; every later one is
    /// session data under those keys.
    fn decrypt(
        &mut self,
        message: &[u8],
    ) -> Result<(Option<Vec<u8>>, Option<session::Status>), Error> {
        let session_data = if self.session.is_none() {
            let establishment: SessionEstablishment = cbor::from_slice(message)?;
            self.session = Some(self.establish(establishment.e_reader_key)?);
            SessionData {
                data: Some(establishment.data),
                status: None,
            }
        } else {
            cbor::from_slice(message)?
        };
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Protocol("no session established".into()))?;
        Ok(session.cipher.open(Direction::ReaderToDevice, &session_data)?)
    }

    fn establish(&self, e_reader_key: Tag24<CoseKey>) -> Result<Session, Error> {
        let transcript =
            SessionTranscript(self.engagement.clone(), e_reader_key.clone(), Handover::QR);
        let e_reader_key = e_reader_key.into_inner();
        let cipher = SessionCipher::derive(&self.e_device_key, &e_reader_key, &transcript)?;
        info!(curve = ?e_reader_key.curve(), "session keys derived");
        Ok(Session {
            e_reader_key,
            transcript,
            cipher,
        })
    }

    async fn respond(&self, request: &DeviceRequest) -> DeviceResponse {
        let mut documents = Vec::new();
        let mut document_errors: Vec<DocumentError> = Vec::new();
        for doc_request in request.doc_requests.iter() {
            let requested = RequestedDocument::from(doc_request);
            match self.present(&requested).await {
                Some(document) => documents.push(document),
                None => document_errors.push(BTreeMap::from([(
                    requested.doc_type,
                    DocumentErrorCode::DataNotReturned,
                )])),
            }
        }
        DeviceResponse {
            version: DeviceResponse::VERSION.into(),
            documents: NonEmptyVec::maybe_new(documents),
            document_errors: NonEmptyVec::maybe_new(document_errors),
            status: ResponseStatus::OK,
        }
    }

    /// One document for `requested`, or `None` if it is skipped.
    async fn present(&self, requested: &RequestedDocument) -> Option<Document> {
        let doc_type = requested.doc_type.as_str();

        self.set_state(State::SelectingCredentials);
        let credential = self.select(requested).await?;

        self.set_state(State::AwaitingConsent);
        let trust = match &self.collaborators.trust {
            Some(trust) => trust.lookup(requested).await,
            None => None,
        };
        if !self
            .collaborators
            .consent
            .consent(requested, &credential, trust.as_ref())
            .await
        {
            info!(doc_type, "consent declined, skipping document request");
            return None;
        }

        self.set_state(State::BuildingResponse);
        match self.build_document(requested, &credential).await {
            Ok(document) => {
                self.collaborators.catalog.record_usage(credential.id).await;
                info!(doc_type, credential = %credential.id, "document prepared");
                Some(document)
            }
            Err(e) => {
                warn!(doc_type, %e, "unable to authenticate document, skipping");
                None
            }
        }
    }

    async fn select(&self, requested: &RequestedDocument) -> Option<Credential> {
        let mut candidates = self
            .collaborators
            .catalog
            .credentials(&requested.doc_type)
            .await;
        candidates.retain(|credential| credential.doc_type() == requested.doc_type);
        match candidates.len() {
            0 => {
                warn!(
                    error = %Error::NoCredential(requested.doc_type.clone()),
                    "skipping document request"
                );
                None
            }
            1 => candidates.pop(),
            count => {
                debug!(count, doc_type = %requested.doc_type, "asking for a selection");
                let Some(chosen) = self
                    .collaborators
                    .selection
                    .select(requested, &candidates)
                    .await
                else {
                    info!(doc_type = %requested.doc_type, "selection declined, skipping");
                    return None;
                };
                let credential = candidates.into_iter().find(|c| c.id == chosen);
                if credential.is_none() {
                    warn!(%chosen, "selection returned an unknown credential");
                }
                credential
            }
        }
    }

    async fn build_document(
        &self,
        requested: &RequestedDocument,
        credential: &Credential,
    ) -> Result<Document, Error> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::Protocol("no session established".into()))?;
        let (issuer_signed, missing) = credential.issuer_signed.filter(&requested.elements);
        let errors = Document::errors_for(missing);
        let namespaces = device_signed::empty_namespaces()?;
        let payload = DeviceAuthentication::new(
            session.transcript.clone(),
            credential.doc_type().to_string(),
            namespaces.clone(),
        )
        .to_bytes()?;
        let device_auth = self.authenticate(credential, session, payload).await?;
        Ok(Document {
            doc_type: credential.doc_type().to_string(),
            issuer_signed,
            device_signed: DeviceSigned {
                namespaces,
                device_auth,
            },
            errors,
        })
    }

    async fn authenticate(
        &self,
        credential: &Credential,
        session: &Session,
        payload: Vec<u8>,
    ) -> Result<DeviceAuth, Error> {
        let store = self.collaborators.key_store.as_ref();
        let alias = credential.key_alias.as_str();
        let _key_session = KeySession::new(store, alias);

        if prefers_mac(credential, &session.e_reader_key, self.config.prefer_signature) {
            debug!(alias, "authenticating with device MAC");
            let e_reader_key = &session.e_reader_key;
            let shared_secret = self
                .with_unlock(credential, move || store.key_agreement(alias, e_reader_key))
                .await?;
            let key = device_signed::emac_key(&shared_secret, &session.transcript)?;
            return Ok(DeviceAuth::DeviceMac(CoseMac0::create_detached(&key, &payload)?));
        }

        if !credential.key_purposes.sign {
            return Err(Error::Crypto(format!(
                "device key '{alias}' can neither sign nor agree on this curve"
            )));
        }
        let algorithm = credential
            .device_key()
            .signature_algorithm()
            .ok_or_else(|| Error::Crypto("device key has no signature algorithm".into()))?;
        debug!(alias, ?algorithm, "authenticating with device signature");
        let prepared = PreparedCoseSign1::new(algorithm, payload, false);
        let tbs = prepared.signature_payload();
        let signature = self
            .with_unlock(credential, move || store.sign(alias, tbs))
            .await?;
        Ok(DeviceAuth::DeviceSignature(prepared.finalize(signature)))
    }

    /// Run a key store operation, asking for unlock input while the key is
    /// locked, up to the configured number of attempts.
    async fn with_unlock<T, F, Fut>(&self, credential: &Credential, mut operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, KeyStoreError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(KeyStoreError::Locked) if attempt < self.config.max_unlock_attempts => {
                    attempt += 1;
                    let Some(input) = self.collaborators.unlock.unlock(credential, attempt).await
                    else {
                        info!(attempt, "unlock declined");
                        return Err(Error::KeyLocked);
                    };
                    match self
                        .collaborators
                        .key_store
                        .unlock(&credential.key_alias, &input)
                        .await
                    {
                        Ok(()) => debug!(attempt, "device key unlocked"),
                        Err(KeyStoreError::Locked) => warn!(attempt, "unlock rejected"),
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(KeyStoreError::Locked) => {
                    warn!(attempts = attempt, "unlock attempts exhausted");
                    return Err(Error::KeyLocked);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn send_response(&mut self, response: &DeviceResponse) -> Result<(), Error> {
        let bytes = cbor::to_vec(response)?;
        let status = (!self.config.allow_multiple_requests)
            .then_some(session::Status::SessionTermination);
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Protocol("no session established".into()))?;
        let sealed = session
            .cipher
            .seal(Direction::DeviceToReader, Some(&bytes), status)?;
        self.connection.send(&sealed).await?;
        info!(
            bytes = sealed.len(),
            terminating = status.is_some(),
            "device response sent"
        );
        Ok(())
    }
}

fn ble_options(topology: Topology, uuid: uuid::Uuid) -> BleOptions {
    match topology {
        Topology::PeripheralServerMode => BleOptions {
            peripheral_server_mode: Some(PeripheralServerMode {
                uuid,
                ble_device_address: None,
            }),
            central_client_mode: None,
        },
        Topology::CentralClientMode => BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode { uuid }),
        },
    }
}

fn parse_request(plaintext: &[u8]) -> Result<DeviceRequest, Error> {
    let request: DeviceRequest = cbor::from_slice(plaintext)?;
    if request.version != DeviceRequest::VERSION {
        return Err(Error::Protocol(format!(
            "unsupported device request version '{}'",
            request.version
        )));
    }
    Ok(request)
}

/// MAC when the device key can agree on the reader's curve, unless a
/// signature was asked for.
fn prefers_mac(credential: &Credential, e_reader_key: &CoseKey, prefer_signature: bool) -> bool {
    credential.key_purposes.agree_key
        && credential.device_key().curve() == e_reader_key.curve()
        && !prefer_signature
}
