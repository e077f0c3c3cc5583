//! Interfaces to the holder's platform: the credential catalog, the secure key
//! store and the user prompts.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cose::CoseSign1;
use crate::definitions::{mso, CoseKey, DocRequest, IssuerSigned, Mso};

/// A stored credential and the alias of its device key.
#[derive(Clone, Debug)]
pub struct Credential {
    pub id: Uuid,
    pub key_alias: String,
    pub key_purposes: KeyPurposes,
    pub issuer_signed: IssuerSigned,
    mso: Mso,
}

/// Operations the device key may be used for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyPurposes {
    pub sign: bool,
    pub agree_key: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("issuerAuth carries no MSO payload")]
    MissingMso,
    #[error(transparent)]
    Mso(#[from] mso::Error),
}

impl Credential {
    pub fn new(
        id: Uuid,
        key_alias: impl Into<String>,
        key_purposes: KeyPurposes,
        issuer_signed: IssuerSigned,
    ) -> Result<Self, CredentialError> {
        let payload = issuer_signed
            .issuer_auth
            .payload()
            .ok_or(CredentialError::MissingMso)?;
        let mso = Mso::from_payload(payload)?;
        Ok(Self {
            id,
            key_alias: key_alias.into(),
            key_purposes,
            issuer_signed,
            mso,
        })
    }

    pub fn doc_type(&self) -> &str {
        &self.mso.doc_type
    }

    pub fn mso(&self) -> &Mso {
        &self.mso
    }

    pub fn device_key(&self) -> &CoseKey {
        &self.mso.device_key_info.device_key
    }
}

/// One document request as presented to the prompts.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestedDocument {
    pub doc_type: String,
    /// Requested element identifiers per namespace.
    pub elements: BTreeMap<String, Vec<String>>,
    pub reader_auth: Option<CoseSign1>,
}

impl From<&DocRequest> for RequestedDocument {
    fn from(doc_request: &DocRequest) -> Self {
        Self {
            doc_type: doc_request.doc_type().to_string(),
            elements: doc_request.requested_elements(),
            reader_auth: doc_request.reader_auth.clone(),
        }
    }
}

/// What is known about the requester.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustInfo {
    pub name: String,
    pub trusted: bool,
}

pub enum UnlockInput {
    Passphrase(Zeroizing<String>),
    Biometric,
}

impl fmt::Debug for UnlockInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockInput::Passphrase(_) => write!(f, "Passphrase(..)"),
            UnlockInput::Biometric => write!(f, "Biometric"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key is locked")]
    Locked,
    #[error("unknown key alias '{0}'")]
    UnknownKey(String),
    #[error("key store failure: {0}")]
    Failed(String),
}

#[async_trait]
pub trait CredentialCatalog: Send + Sync {
    /// Credentials whose MSO names `doc_type`.
    async fn credentials(&self, doc_type: &str) -> Vec<Credential>;
    /// Record that a credential was presented.
    async fn record_usage(&self, id: Uuid);
}

/// Holds device keys. Operations may fail with [KeyStoreError::Locked] until
/// [SecureKeyStore::unlock] succeeds.
#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    /// Sign `payload`, returning the raw `r || s` signature.
    async fn sign(&self, alias: &str, payload: &[u8]) -> Result<Vec<u8>, KeyStoreError>;
    /// ECDH between the device key and `peer`.
    async fn key_agreement(
        &self,
        alias: &str,
        peer: &CoseKey,
    ) -> Result<Zeroizing<Vec<u8>>, KeyStoreError>;
    async fn unlock(&self, alias: &str, input: &UnlockInput) -> Result<(), KeyStoreError>;
    /// End any session held open for `alias` since the last unlock.
    fn release(&self, alias: &str);
}

#[async_trait]
pub trait SelectionPrompt: Send + Sync {
    /// Choose among several matching credentials. `None` declines.
    async fn select(&self, request: &RequestedDocument, candidates: &[Credential]) -> Option<Uuid>;
}

#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    async fn consent(
        &self,
        request: &RequestedDocument,
        credential: &Credential,
        trust: Option<&TrustInfo>,
    ) -> bool;
}

#[async_trait]
pub trait UnlockPrompt: Send + Sync {
    /// Ask for unlock input; `attempt` starts at 1. `None` declines.
    async fn unlock(&self, credential: &Credential, attempt: u32) -> Option<UnlockInput>;
}

#[async_trait]
pub trait TrustLookup: Send + Sync {
    async fn lookup(&self, request: &RequestedDocument) -> Option<TrustInfo>;
}

/// Everything the holder engine delegates to the platform.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CredentialCatalog>,
    pub key_store: Arc<dyn SecureKeyStore>,
    pub selection: Arc<dyn SelectionPrompt>,
    pub consent: Arc<dyn ConsentPrompt>,
    pub unlock: Arc<dyn UnlockPrompt>,
    pub trust: Option<Arc<dyn TrustLookup>>,
}

/// Releases the key store session for an alias when dropped, including when
/// the signing future is cancelled.
pub(crate) struct KeySession<'a> {
    store: &'a dyn SecureKeyStore,
    alias: &'a str,
}

impl<'a> KeySession<'a> {
    pub(crate) fn new(store: &'a dyn SecureKeyStore, alias: &'a str) -> Self {
        Self { store, alias }
    }
}

impl Drop for KeySession<'_> {
    fn drop(&mut self) {
        self.store.release(self.alias);
    }
}
