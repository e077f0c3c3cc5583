#![allow(dead_code)]
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ciborium::Value;
use p256::ecdsa::{Signature, SigningKey};
use rand::{rngs::OsRng, RngCore};
use signature::Signer;
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;
use zeroize::Zeroizing;

use mdoc_proximity::cbor;
use mdoc_proximity::config::{Role, SessionConfig, Topology};
use mdoc_proximity::cose::CoseSign1;
use mdoc_proximity::definitions::{
    helpers::{ByteStr, NonEmptyMap, NonEmptyVec, Tag24},
    mso::DigestIds,
    session::Status,
    CoseKey, DeviceEngagement, DeviceKeyInfo, DeviceRequest, DigestAlgorithm, Direction,
    DocRequest, EphemeralSecret, Handover, IssuerSigned, IssuerSignedItem, ItemsRequest, Mso,
    SessionCipher, SessionEstablishment, SessionTranscript, ValidityInfo,
};
use mdoc_proximity::presentation::collaborators::{
    Collaborators, ConsentPrompt, Credential, CredentialCatalog, KeyPurposes, KeyStoreError,
    RequestedDocument, SecureKeyStore, SelectionPrompt, TrustInfo, TrustLookup, UnlockInput,
    UnlockPrompt,
};
use mdoc_proximity::presentation::device::PresentmentEngine;
use mdoc_proximity::presentation::reader::RequestedElements;
use mdoc_proximity::presentation::Notification;
use mdoc_proximity::transport::memory::MemoryMedium;

pub const DOC_A: &str = "doc.A";
pub const DOC_B: &str = "doc.B";
pub const NAMESPACE: &str = "ns";
pub const PASSPHRASE: &str = "correct horse";

pub fn config(role: Role, topology: Topology) -> SessionConfig {
    let mut config = SessionConfig::new(role, topology, Uuid::new_v4());
    // Small enough that every message spans several chunks.
    config.chunk_size = 64;
    config
}

pub fn request(doc_type: &str, elements: &[&str]) -> (String, RequestedElements) {
    (
        doc_type.to_string(),
        BTreeMap::from([(
            NAMESPACE.to_string(),
            elements.iter().map(|element| element.to_string()).collect(),
        )]),
    )
}

/// An encoded device request for one element of `doc_type`.
pub fn device_request(doc_type: &str, element: &str) -> Result<Vec<u8>> {
    let items_request = ItemsRequest {
        doc_type: doc_type.to_string(),
        namespaces: NonEmptyMap::new(
            NAMESPACE.to_string(),
            NonEmptyMap::new(element.to_string(), false),
        ),
        request_info: None,
    };
    let request = DeviceRequest {
        version: DeviceRequest::VERSION.to_string(),
        doc_requests: NonEmptyVec::new(DocRequest {
            items_request: Tag24::new(items_request)?,
            reader_auth: None,
        }),
    };
    Ok(cbor::to_vec(&request)?)
}

/// The verifier's session keys for a QR engagement, for building envelopes
/// a [SessionManager](mdoc_proximity::presentation::reader::SessionManager)
/// would never send.
pub struct ReaderKeys {
    e_reader_key: Tag24<CoseKey>,
    cipher: SessionCipher,
}

impl ReaderKeys {
    pub fn new(qr_code_uri: &str) -> Result<Self> {
        let engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(qr_code_uri)?;
        let e_device_key = engagement.as_ref().e_device_key().as_ref().clone();
        let secret = EphemeralSecret::generate(e_device_key.curve())?;
        let e_reader_key = Tag24::new(secret.public_key())?;
        let transcript = SessionTranscript(engagement, e_reader_key.clone(), Handover::QR);
        let cipher = SessionCipher::derive(&secret, &e_device_key, &transcript)?;
        Ok(Self {
            e_reader_key,
            cipher,
        })
    }

    /// The first message of the session, carrying `request`.
    pub fn establish(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let data = self.cipher.encrypt(Direction::ReaderToDevice, request)?;
        Ok(cbor::to_vec(&SessionEstablishment {
            e_reader_key: self.e_reader_key.clone(),
            data: data.into(),
        })?)
    }

    pub fn seal(&mut self, request: Option<&[u8]>, status: Option<Status>) -> Result<Vec<u8>> {
        Ok(self.cipher.seal(Direction::ReaderToDevice, request, status)?)
    }
}

/// Issues credentials signed with a P-256 key.
pub struct Issuer {
    key: SigningKey,
}

impl Issuer {
    pub fn new() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn public_key(&self) -> CoseKey {
        CoseKey::from(&p256::PublicKey::from(self.key.verifying_key()))
    }

    /// Issue a credential valid from yesterday until next year.
    pub fn issue(&self, doc_type: &str, elements: &[(&str, Value)], device_key: CoseKey) -> Result<IssuerSigned> {
        let now = now();
        let validity = ValidityInfo::new(
            now - Duration::days(1),
            now - Duration::days(1),
            now + Duration::days(365),
            None,
        )?;
        self.issue_with_validity(doc_type, elements, device_key, validity)
    }

    pub fn issue_with_validity(
        &self,
        doc_type: &str,
        elements: &[(&str, Value)],
        device_key: CoseKey,
        validity_info: ValidityInfo,
    ) -> Result<IssuerSigned> {
        let items = elements
            .iter()
            .enumerate()
            .map(|(digest_id, (identifier, value))| {
                let mut random = vec![0u8; 16];
                OsRng.fill_bytes(&mut random);
                Tag24::new(IssuerSignedItem {
                    digest_id: digest_id as u64,
                    random: ByteStr::from(random),
                    element_identifier: identifier.to_string(),
                    element_value: value.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let digests = items
            .iter()
            .map(|item| -> Result<_> {
                let digest = item
                    .digest(DigestAlgorithm::SHA256)
                    .context("unable to digest item")?;
                Ok((item.as_ref().digest_id, ByteStr::from(digest)))
            })
            .collect::<Result<DigestIds>>()?;
        let mso = Mso {
            version: Mso::VERSION.to_string(),
            digest_algorithm: DigestAlgorithm::SHA256,
            value_digests: BTreeMap::from([(NAMESPACE.to_string(), digests)]),
            device_key_info: DeviceKeyInfo {
                device_key,
                key_authorizations: None,
            },
            doc_type: doc_type.to_string(),
            validity_info,
        };
        let payload = Tag24::new(mso)?.to_tagged_bytes()?;
        let issuer_auth = CoseSign1::sign::<_, Signature>(&self.key, payload);
        Ok(IssuerSigned {
            namespaces: Some(NonEmptyMap::new(
                NAMESPACE.to_string(),
                NonEmptyVec::maybe_new(items).context("no elements")?,
            )),
            issuer_auth,
        })
    }
}

pub fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

struct StoredKey {
    key: SigningKey,
    passphrase: Option<String>,
    unlocked: bool,
}

/// Holds P-256 device keys in memory. A key created with a passphrase is
/// locked until unlocked and locks again when released.
#[derive(Default)]
pub struct SoftwareKeyStore {
    keys: Mutex<HashMap<String, StoredKey>>,
    releases: Mutex<HashMap<String, u32>>,
}

impl SoftwareKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self, alias: &str, passphrase: Option<&str>) -> CoseKey {
        let key = SigningKey::random(&mut OsRng);
        let public_key = CoseKey::from(&p256::PublicKey::from(key.verifying_key()));
        self.keys.lock().unwrap().insert(
            alias.to_string(),
            StoredKey {
                key,
                passphrase: passphrase.map(str::to_string),
                unlocked: false,
            },
        );
        public_key
    }

    pub fn releases(&self, alias: &str) -> u32 {
        self.releases.lock().unwrap().get(alias).copied().unwrap_or(0)
    }

    fn with_key<T>(
        &self,
        alias: &str,
        f: impl FnOnce(&SigningKey) -> Result<T, KeyStoreError>,
    ) -> Result<T, KeyStoreError> {
        let keys = self.keys.lock().unwrap();
        let stored = keys
            .get(alias)
            .ok_or_else(|| KeyStoreError::UnknownKey(alias.to_string()))?;
        if stored.passphrase.is_some() && !stored.unlocked {
            return Err(KeyStoreError::Locked);
        }
        f(&stored.key)
    }
}

#[async_trait]
impl SecureKeyStore for SoftwareKeyStore {
    async fn sign(&self, alias: &str, payload: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.with_key(alias, |key| {
            let signature: Signature = key.sign(payload);
            Ok(signature.to_bytes().to_vec())
        })
    }

    async fn key_agreement(
        &self,
        alias: &str,
        peer: &CoseKey,
    ) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
        let peer = p256::PublicKey::try_from(peer)
            .map_err(|e| KeyStoreError::Failed(e.to_string()))?;
        self.with_key(alias, |key| {
            let shared = p256::ecdh::diffie_hellman(key.as_nonzero_scalar(), peer.as_affine());
            Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
        })
    }

    async fn unlock(&self, alias: &str, input: &UnlockInput) -> Result<(), KeyStoreError> {
        let mut keys = self.keys.lock().unwrap();
        let stored = keys
            .get_mut(alias)
            .ok_or_else(|| KeyStoreError::UnknownKey(alias.to_string()))?;
        match input {
            UnlockInput::Passphrase(passphrase)
                if stored.passphrase.as_deref() == Some(passphrase.as_str()) =>
            {
                stored.unlocked = true;
                Ok(())
            }
            _ => Err(KeyStoreError::Locked),
        }
    }

    fn release(&self, alias: &str) {
        if let Some(stored) = self.keys.lock().unwrap().get_mut(alias) {
            stored.unlocked = false;
        }
        *self
            .releases
            .lock()
            .unwrap()
            .entry(alias.to_string())
            .or_default() += 1;
    }
}

/// Credentials held in memory, counting how often each is presented.
pub struct MemoryCatalog {
    credentials: Vec<Credential>,
    usage: Mutex<HashMap<Uuid, u32>>,
}

impl MemoryCatalog {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn usage(&self, id: Uuid) -> u32 {
        self.usage.lock().unwrap().get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CredentialCatalog for MemoryCatalog {
    async fn credentials(&self, doc_type: &str) -> Vec<Credential> {
        self.credentials
            .iter()
            .filter(|credential| credential.doc_type() == doc_type)
            .cloned()
            .collect()
    }

    async fn record_usage(&self, id: Uuid) {
        *self.usage.lock().unwrap().entry(id).or_default() += 1;
    }
}

/// Answers every prompt from a script and counts the questions asked.
pub struct ScriptedPrompts {
    pub selection: Option<Uuid>,
    pub consent: bool,
    /// Passphrases offered on successive unlock prompts; further prompts are
    /// declined.
    pub passphrases: Vec<String>,
    pub trust: Option<TrustInfo>,
    pub selections: AtomicU32,
    pub consents: AtomicU32,
    pub unlocks: AtomicU32,
    pub trust_seen: Mutex<Vec<Option<TrustInfo>>>,
}

impl Default for ScriptedPrompts {
    fn default() -> Self {
        Self {
            selection: None,
            consent: true,
            passphrases: Vec::new(),
            trust: None,
            selections: AtomicU32::new(0),
            consents: AtomicU32::new(0),
            unlocks: AtomicU32::new(0),
            trust_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SelectionPrompt for ScriptedPrompts {
    async fn select(&self, _: &RequestedDocument, _: &[Credential]) -> Option<Uuid> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        self.selection
    }
}

#[async_trait]
impl ConsentPrompt for ScriptedPrompts {
    async fn consent(&self, _: &RequestedDocument, _: &Credential, trust: Option<&TrustInfo>) -> bool {
        self.consents.fetch_add(1, Ordering::SeqCst);
        self.trust_seen.lock().unwrap().push(trust.cloned());
        self.consent
    }
}

#[async_trait]
impl UnlockPrompt for ScriptedPrompts {
    async fn unlock(&self, _: &Credential, attempt: u32) -> Option<UnlockInput> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        self.passphrases
            .get(attempt as usize - 1)
            .map(|passphrase| UnlockInput::Passphrase(Zeroizing::new(passphrase.clone())))
    }
}

#[async_trait]
impl TrustLookup for ScriptedPrompts {
    async fn lookup(&self, _: &RequestedDocument) -> Option<TrustInfo> {
        self.trust.clone()
    }
}

/// A holder's credentials, keys and prompts.
pub struct Wallet {
    pub issuer: Issuer,
    pub store: Arc<SoftwareKeyStore>,
    pub credentials: Vec<Credential>,
}

impl Wallet {
    pub fn new() -> Self {
        Self {
            issuer: Issuer::new(),
            store: Arc::new(SoftwareKeyStore::new()),
            credentials: Vec::new(),
        }
    }

    /// Issue and store a credential for `doc_type` with a name and an age.
    pub fn add(&mut self, doc_type: &str, purposes: KeyPurposes, passphrase: Option<&str>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let alias = id.to_string();
        let device_key = self.store.generate(&alias, passphrase);
        let issuer_signed = self.issuer.issue(
            doc_type,
            &[
                ("name", Value::Text("Alice".into())),
                ("age", Value::Integer(42.into())),
            ],
            device_key,
        )?;
        self.credentials
            .push(Credential::new(id, alias, purposes, issuer_signed)?);
        Ok(id)
    }

    pub fn collaborators(&self, prompts: Arc<ScriptedPrompts>) -> (Collaborators, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::new(self.credentials.clone()));
        let collaborators = Collaborators {
            catalog: catalog.clone(),
            key_store: self.store.clone(),
            selection: prompts.clone(),
            consent: prompts.clone(),
            unlock: prompts.clone(),
            trust: Some(prompts),
        };
        (collaborators, catalog)
    }
}

pub const SIGN_ONLY: KeyPurposes = KeyPurposes {
    sign: true,
    agree_key: false,
};

pub const SIGN_AND_AGREE: KeyPurposes = KeyPurposes {
    sign: true,
    agree_key: true,
};

/// A holder engine on `medium` with its notification stream.
pub fn holder(
    config: SessionConfig,
    medium: &MemoryMedium,
    collaborators: Collaborators,
) -> Result<(PresentmentEngine, UnboundedReceiver<Notification>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = PresentmentEngine::new(config, &medium.radio(), collaborators, tx)?;
    Ok((engine, rx))
}

/// Everything sent so far on a notification stream.
pub fn drain(notifications: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut drained = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        drained.push(notification);
    }
    drained
}
