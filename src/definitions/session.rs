//! Session establishment, the session envelope and the session cipher.
//!
//! The verifier opens a session with a [SessionEstablishment] carrying its
//! ephemeral key; every later message in either direction is a [SessionData]
//! envelope. Both sides derive the same pair of AES-256-GCM keys from an ECDH
//! between the two ephemeral keys, salted with the hash of the
//! [SessionTranscript].
use crate::cbor::{self, CborError};
use crate::definitions::{
    device_engagement::DeviceEngagementBytes,
    device_key::cose_key::{self, EC2Curve},
    helpers::{ByteStr, Tag24},
    CoseKey,
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ciborium::Value;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub type EReaderKeyBytes = Tag24<CoseKey>;
pub type SessionTranscriptBytes = Tag24<SessionTranscript>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEstablishment {
    pub e_reader_key: EReaderKeyBytes,
    pub data: ByteStr,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

/// Status codes carried in [SessionData].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u64", into = "u64")]
pub enum Status {
    SessionEncryptionError,
    CborDecodingError,
    SessionTermination,
}

/// `[DeviceEngagementBytes, EReaderKeyBytes, Handover]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionTranscript(
    pub DeviceEngagementBytes,
    pub EReaderKeyBytes,
    pub Handover,
);

/// The channel that carried device engagement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum Handover {
    /// Engagement by QR code, encoded as `null`.
    QR,
    /// Engagement by NFC: the handover select message and, for negotiated
    /// handover, the handover request message.
    NFC(ByteStr, Option<ByteStr>),
}

/// Direction of a session message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Holder to verifier, keyed by `SKDevice`.
    DeviceToReader,
    /// Verifier to holder, keyed by `SKReader`.
    ReaderToDevice,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Curve not supported for DH exchange")]
    UnsupportedCurve,
    #[error("ephemeral keys are on different curves")]
    CurveMismatch,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(#[from] cose_key::Error),
    #[error("unable to encode session structure: {0}")]
    Cbor(#[from] CborError),
    #[error("unable to encode session transcript: {0}")]
    Transcript(#[from] crate::definitions::helpers::tag24::Error),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed for message {counter} ({direction:?})")]
    Decryption { direction: Direction, counter: u32 },
    #[error("message counter exhausted")]
    CounterExhausted,
    #[error("invalid session status code {0}")]
    InvalidStatus(u64),
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Status> for u64 {
    fn from(status: Status) -> u64 {
        match status {
            Status::SessionEncryptionError => 10,
            Status::CborDecodingError => 11,
            Status::SessionTermination => 20,
        }
    }
}

impl TryFrom<u64> for Status {
    type Error = Error;

    fn try_from(code: u64) -> Result<Status> {
        match code {
            10 => Ok(Status::SessionEncryptionError),
            11 => Ok(Status::CborDecodingError),
            20 => Ok(Status::SessionTermination),
            _ => Err(Error::InvalidStatus(code)),
        }
    }
}

impl From<Handover> for Value {
    fn from(handover: Handover) -> Value {
        match handover {
            Handover::QR => Value::Null,
            Handover::NFC(select, request) => Value::Array(vec![
                Value::Bytes(select.into()),
                request
                    .map(|request| Value::Bytes(request.into()))
                    .unwrap_or(Value::Null),
            ]),
        }
    }
}

impl TryFrom<Value> for Handover {
    type Error = CborError;

    fn try_from(value: Value) -> std::result::Result<Handover, CborError> {
        match value {
            Value::Null => Ok(Handover::QR),
            Value::Array(items) => match <[Value; 2]>::try_from(items) {
                Ok([Value::Bytes(select), Value::Null]) => Ok(Handover::NFC(select.into(), None)),
                Ok([Value::Bytes(select), Value::Bytes(request)]) => {
                    Ok(Handover::NFC(select.into(), Some(request.into())))
                }
                _ => Err(CborError::UnexpectedItem("array", "NFC handover")),
            },
            _ => Err(CborError::UnexpectedItem("value", "handover")),
        }
    }
}

impl SessionTranscript {
    /// The tag 24 encoding hashed into key derivation and embedded in
    /// device authentication.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(Tag24::new(self.clone())?.to_tagged_bytes()?)
    }
}

impl SessionData {
    pub fn termination() -> Self {
        SessionData {
            data: None,
            status: Some(Status::SessionTermination),
        }
    }

    pub fn is_termination(&self) -> bool {
        self.status == Some(Status::SessionTermination)
    }
}

/// An ephemeral ECDH secret for one session.
pub enum EphemeralSecret {
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
}

impl std::fmt::Debug for EphemeralSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EphemeralSecret::P256(_) => f.write_str("EphemeralSecret::P256"),
            EphemeralSecret::P384(_) => f.write_str("EphemeralSecret::P384"),
        }
    }
}

impl EphemeralSecret {
    pub fn generate(curve: EC2Curve) -> Result<Self> {
        match curve {
            EC2Curve::P256 => Ok(EphemeralSecret::P256(p256::ecdh::EphemeralSecret::random(
                &mut OsRng,
            ))),
            EC2Curve::P384 => Ok(EphemeralSecret::P384(p384::ecdh::EphemeralSecret::random(
                &mut OsRng,
            ))),
            EC2Curve::P521 => Err(Error::UnsupportedCurve),
        }
    }

    pub fn curve(&self) -> EC2Curve {
        match self {
            EphemeralSecret::P256(_) => EC2Curve::P256,
            EphemeralSecret::P384(_) => EC2Curve::P384,
        }
    }

    pub fn public_key(&self) -> CoseKey {
        match self {
            EphemeralSecret::P256(secret) => CoseKey::from(&secret.public_key()),
            EphemeralSecret::P384(secret) => CoseKey::from(&secret.public_key()),
        }
    }

    /// ECDH with the peer's ephemeral key, returning the raw shared secret.
    pub fn agree(&self, peer: &CoseKey) -> Result<Zeroizing<Vec<u8>>> {
        if peer.curve() != self.curve() {
            return Err(Error::CurveMismatch);
        }
        match self {
            EphemeralSecret::P256(secret) => {
                let peer = p256::PublicKey::try_from(peer)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            EphemeralSecret::P384(secret) => {
                let peer = p384::PublicKey::try_from(peer)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
        }
    }
}

/// HKDF-SHA256 over `shared_secret`, salted with `SHA-256(transcript_bytes)`.
pub fn derive_key(shared_secret: &[u8], transcript_bytes: &[u8], info: &str) -> Result<[u8; 32]> {
    let salt = Sha256::digest(transcript_bytes);
    let mut okm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(&salt), shared_secret)
        .expand(info.as_bytes(), &mut okm)
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// The `SKDevice` and `SKReader` keys of one session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    sk_device: [u8; 32],
    sk_reader: [u8; 32],
}

impl SessionKeys {
    pub fn derive(shared_secret: &[u8], transcript: &SessionTranscript) -> Result<Self> {
        let transcript_bytes = transcript.to_bytes()?;
        Ok(SessionKeys {
            sk_device: derive_key(shared_secret, &transcript_bytes, "SKDevice")?,
            sk_reader: derive_key(shared_secret, &transcript_bytes, "SKReader")?,
        })
    }

    fn key(&self, direction: Direction) -> &[u8; 32] {
        match direction {
            Direction::DeviceToReader => &self.sk_device,
            Direction::ReaderToDevice => &self.sk_reader,
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Message counters for one direction. The encrypting side and the
/// decrypting side advance independently, both starting at 1.
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    sent: u32,
    received: u32,
}

/// Authenticated encryption of session messages.
///
/// The nonce is the 8-byte direction identifier followed by the big-endian
/// message counter, so a ciphertext only decrypts at its own position in the
/// stream. Replayed, dropped or reordered messages fail authentication.
#[derive(Debug)]
pub struct SessionCipher {
    keys: SessionKeys,
    device_to_reader: Counters,
    reader_to_device: Counters,
}

impl SessionCipher {
    pub fn new(keys: SessionKeys) -> Self {
        SessionCipher {
            keys,
            device_to_reader: Counters::default(),
            reader_to_device: Counters::default(),
        }
    }

    /// ECDH between the two ephemeral keys, then key derivation over the
    /// transcript.
    pub fn derive(
        local_ephemeral: &EphemeralSecret,
        remote_ephemeral: &CoseKey,
        transcript: &SessionTranscript,
    ) -> Result<Self> {
        let shared_secret = local_ephemeral.agree(remote_ephemeral)?;
        Ok(Self::new(SessionKeys::derive(&shared_secret, transcript)?))
    }

    fn counters(&mut self, direction: Direction) -> &mut Counters {
        match direction {
            Direction::DeviceToReader => &mut self.device_to_reader,
            Direction::ReaderToDevice => &mut self.reader_to_device,
        }
    }

    pub fn encrypt(&mut self, direction: Direction, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self
            .counters(direction)
            .sent
            .checked_add(1)
            .ok_or(Error::CounterExhausted)?;
        let cipher = Aes256Gcm::new_from_slice(self.keys.key(direction))
            .map_err(|_| Error::Encryption)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce(direction, counter)), plaintext)
            .map_err(|_| Error::Encryption)?;
        self.counters(direction).sent = counter;
        Ok(ciphertext)
    }

    /// Decrypt the next expected message in `direction`. The counter only
    /// advances on success.
    pub fn decrypt(&mut self, direction: Direction, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let counter = self
            .counters(direction)
            .received
            .checked_add(1)
            .ok_or(Error::CounterExhausted)?;
        let cipher = Aes256Gcm::new_from_slice(self.keys.key(direction))
            .map_err(|_| Error::Decryption { direction, counter })?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce(direction, counter)), ciphertext)
            .map_err(|_| Error::Decryption { direction, counter })?;
        self.counters(direction).received = counter;
        Ok(plaintext)
    }

    /// Encrypt `plaintext` (if any) into an encoded [SessionData] envelope,
    /// optionally carrying `status`.
    pub fn seal(
        &mut self,
        direction: Direction,
        plaintext: Option<&[u8]>,
        status: Option<Status>,
    ) -> Result<Vec<u8>> {
        let data = plaintext
            .map(|plaintext| self.encrypt(direction, plaintext))
            .transpose()?
            .map(ByteStr::from);
        Ok(cbor::to_vec(&SessionData { data, status })?)
    }

    /// Decrypt a [SessionData] envelope. Returns the plaintext, if the
    /// envelope carried data, and its status.
    pub fn open(
        &mut self,
        direction: Direction,
        session_data: &SessionData,
    ) -> Result<(Option<Vec<u8>>, Option<Status>)> {
        let plaintext = session_data
            .data
            .as_ref()
            .map(|data| self.decrypt(direction, data.as_ref()))
            .transpose()?;
        Ok((plaintext, session_data.status))
    }
}

fn nonce(direction: Direction, counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    if direction == Direction::DeviceToReader {
        nonce[7] = 1;
    }
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::device_engagement::{BleOptions, DeviceEngagement, PeripheralServerMode};
    use uuid::Uuid;

    fn transcript(device: &EphemeralSecret, reader: &EphemeralSecret) -> SessionTranscript {
        let engagement = DeviceEngagement::new(
            Tag24::new(device.public_key()).unwrap(),
            BleOptions {
                peripheral_server_mode: Some(PeripheralServerMode {
                    uuid: Uuid::new_v4(),
                    ble_device_address: None,
                }),
                central_client_mode: None,
            },
        );
        SessionTranscript(
            Tag24::new(engagement).unwrap(),
            Tag24::new(reader.public_key()).unwrap(),
            Handover::QR,
        )
    }

    fn cipher_pair() -> (SessionCipher, SessionCipher) {
        let device = EphemeralSecret::generate(EC2Curve::P256).unwrap();
        let reader = EphemeralSecret::generate(EC2Curve::P256).unwrap();
        let transcript = transcript(&device, &reader);
        let holder = SessionCipher::derive(&device, &reader.public_key(), &transcript).unwrap();
        let verifier = SessionCipher::derive(&reader, &device.public_key(), &transcript).unwrap();
        (holder, verifier)
    }

    #[test]
    fn both_sides_derive_the_same_keys() {
        let (mut holder, mut verifier) = cipher_pair();
        let request = verifier
            .encrypt(Direction::ReaderToDevice, b"request")
            .unwrap();
        assert_eq!(
            holder.decrypt(Direction::ReaderToDevice, &request).unwrap(),
            b"request"
        );
        let response = holder.encrypt(Direction::DeviceToReader, b"response").unwrap();
        assert_eq!(
            verifier.decrypt(Direction::DeviceToReader, &response).unwrap(),
            b"response"
        );
    }

    #[test]
    fn encrypt_then_decrypt_on_one_instance() {
        let (mut holder, _) = cipher_pair();
        let plaintexts: [&[u8]; 3] = [b"", b"a", &[0x5a; 1000]];
        for plaintext in plaintexts {
            let ciphertext = holder.encrypt(Direction::DeviceToReader, plaintext).unwrap();
            assert_eq!(
                holder.decrypt(Direction::DeviceToReader, &ciphertext).unwrap(),
                plaintext
            );
        }
    }

    #[test]
    fn replay_is_rejected() {
        let (mut holder, mut verifier) = cipher_pair();
        let first = verifier.encrypt(Direction::ReaderToDevice, b"one").unwrap();
        holder.decrypt(Direction::ReaderToDevice, &first).unwrap();
        assert!(matches!(
            holder.decrypt(Direction::ReaderToDevice, &first),
            Err(Error::Decryption { counter: 2, .. })
        ));
    }

    #[test]
    fn directions_are_independent() {
        let (mut holder, mut verifier) = cipher_pair();
        let request = verifier.encrypt(Direction::ReaderToDevice, b"one").unwrap();
        assert!(holder.decrypt(Direction::DeviceToReader, &request).is_err());
    }

    #[test]
    fn different_transcripts_do_not_share_keys() {
        let device = EphemeralSecret::generate(EC2Curve::P256).unwrap();
        let reader = EphemeralSecret::generate(EC2Curve::P256).unwrap();
        let mut first =
            SessionCipher::derive(&device, &reader.public_key(), &transcript(&device, &reader))
                .unwrap();
        let mut second =
            SessionCipher::derive(&reader, &device.public_key(), &transcript(&device, &reader))
                .unwrap();
        let ciphertext = first.encrypt(Direction::ReaderToDevice, b"one").unwrap();
        assert!(second.decrypt(Direction::ReaderToDevice, &ciphertext).is_err());
    }

    #[test]
    fn corrupted_ciphertext_is_rejected() {
        let (mut holder, mut verifier) = cipher_pair();
        let mut ciphertext = verifier.encrypt(Direction::ReaderToDevice, b"one").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(holder.decrypt(Direction::ReaderToDevice, &ciphertext).is_err());
    }

    #[test]
    fn envelope_carries_status() {
        let (mut holder, mut verifier) = cipher_pair();
        let sealed = holder
            .seal(
                Direction::DeviceToReader,
                Some(b"response"),
                Some(Status::SessionTermination),
            )
            .unwrap();
        let session_data: SessionData = cbor::from_slice(&sealed).unwrap();
        assert!(session_data.is_termination());
        let (plaintext, status) = verifier
            .open(Direction::DeviceToReader, &session_data)
            .unwrap();
        assert_eq!(plaintext.as_deref(), Some(&b"response"[..]));
        assert_eq!(status, Some(Status::SessionTermination));
    }

    #[test]
    fn handover_encoding() {
        assert_eq!(Value::from(Handover::QR), Value::Null);
        let nfc = Handover::NFC(vec![1, 2].into(), None);
        let bytes = cbor::to_vec(&nfc).unwrap();
        assert_eq!(cbor::from_slice::<Handover>(&bytes).unwrap(), nfc);
    }

    #[test]
    fn mismatched_curves_cannot_agree() {
        let device = EphemeralSecret::generate(EC2Curve::P256).unwrap();
        let reader = EphemeralSecret::generate(EC2Curve::P384).unwrap();
        assert!(matches!(
            device.agree(&reader.public_key()),
            Err(Error::CurveMismatch)
        ));
    }
}
