use crate::cbor::{self, CborError};
use crate::definitions::{
    device_key::{self, DeviceKeyInfo},
    helpers::{ByteStr, Tag24},
    validity_info::ValidityInfo,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::BTreeMap;

pub type DigestId = u64;
pub type DigestIds = BTreeMap<DigestId, ByteStr>;

/// The mobile security object: the issuer-signed payload of `issuerAuth`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mso {
    pub version: String,
    pub digest_algorithm: DigestAlgorithm,
    pub value_digests: BTreeMap<String, DigestIds>,
    pub device_key_info: DeviceKeyInfo,
    pub doc_type: String,
    pub validity_info: ValidityInfo,
}

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA-256")]
    SHA256,
    #[serde(rename = "SHA-384")]
    SHA384,
    #[serde(rename = "SHA-512")]
    SHA512,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to decode the mobile security object: {0}")]
    Decode(#[from] CborError),
    #[error("invalid key authorizations: {0}")]
    KeyAuthorizations(#[from] device_key::Error),
    #[error("unsupported MSO version '{0}'")]
    UnsupportedVersion(String),
}

impl Mso {
    pub const VERSION: &'static str = "1.0";

    /// Decode an MSO from the `issuerAuth` payload, which carries it as a
    /// tag 24 embedded data item.
    ///
    /// The validity window is checked while decoding, so an MSO with
    /// `validUntil <= validFrom` or `validFrom < signed` never gets this far.
    pub fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        let mso = cbor::from_slice::<Tag24<Mso>>(payload)?.into_inner();
        mso.validate()?;
        Ok(mso)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.version != Self::VERSION {
            return Err(Error::UnsupportedVersion(self.version.clone()));
        }
        if let Some(authorizations) = &self.device_key_info.key_authorizations {
            authorizations.validate()?;
        }
        Ok(())
    }

    pub fn digest_for(&self, namespace: &str, digest_id: DigestId) -> Option<&ByteStr> {
        self.value_digests.get(namespace)?.get(&digest_id)
    }
}

impl DigestAlgorithm {
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::SHA256 => Sha256::digest(bytes).to_vec(),
            DigestAlgorithm::SHA384 => Sha384::digest(bytes).to_vec(),
            DigestAlgorithm::SHA512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor::Value;
    use crate::definitions::device_key::CoseKey;
    use rand::rngs::OsRng;

    fn tdate(s: &str) -> Value {
        Value::Tag(0, Box::new(Value::Text(s.to_string())))
    }

    fn mso_payload(valid_from: &str, valid_until: &str) -> Vec<u8> {
        let device_key = CoseKey::from(&p256::SecretKey::random(&mut OsRng).public_key());
        let mso = Value::Map(vec![
            (Value::Text("version".into()), Value::Text("1.0".into())),
            (Value::Text("digestAlgorithm".into()), Value::Text("SHA-256".into())),
            (Value::Text("valueDigests".into()), Value::Map(vec![(
                Value::Text("doc.A.ns".into()),
                Value::Map(vec![(Value::Integer(0.into()), Value::Bytes(vec![0; 32]))]),
            )])),
            (Value::Text("deviceKeyInfo".into()), Value::Map(vec![(
                Value::Text("deviceKey".into()),
                Value::from(device_key),
            )])),
            (Value::Text("docType".into()), Value::Text("doc.A".into())),
            (Value::Text("validityInfo".into()), Value::Map(vec![
                (Value::Text("signed".into()), tdate("2024-01-01T00:00:00Z")),
                (Value::Text("validFrom".into()), tdate(valid_from)),
                (Value::Text("validUntil".into()), tdate(valid_until)),
            ])),
        ]);
        let inner = cbor::to_vec(&mso).unwrap();
        cbor::to_vec(&Value::Tag(24, Box::new(Value::Bytes(inner)))).unwrap()
    }

    #[test]
    fn parses_well_formed_mso() {
        let mso = Mso::from_payload(&mso_payload("2024-01-01T00:00:00Z", "2030-01-01T00:00:00Z"))
            .unwrap();
        assert_eq!(mso.doc_type, "doc.A");
        assert_eq!(mso.digest_algorithm, DigestAlgorithm::SHA256);
        assert_eq!(mso.digest_for("doc.A.ns", 0).map(|d| d.len()), Some(32));
        assert!(mso.digest_for("doc.A.ns", 1).is_none());
    }

    #[test]
    fn rejects_inverted_validity_window() {
        assert!(
            Mso::from_payload(&mso_payload("2030-01-01T00:00:00Z", "2029-01-01T00:00:00Z"))
                .is_err()
        );
    }

    #[test]
    fn rejects_validity_before_signing() {
        assert!(
            Mso::from_payload(&mso_payload("2023-12-31T00:00:00Z", "2029-01-01T00:00:00Z"))
                .is_err()
        );
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(DigestAlgorithm::SHA256.digest(b"abc").len(), 32);
        assert_eq!(DigestAlgorithm::SHA384.digest(b"abc").len(), 48);
        assert_eq!(DigestAlgorithm::SHA512.digest(b"abc").len(), 64);
    }
}
