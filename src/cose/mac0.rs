use super::{protected_algorithm, Error, SignatureAlgorithm};
use coset::{
    cbor::Value, iana, mac_structure_data, AsCborValue, CoseMac0Builder, HeaderBuilder,
    MacContext,
};
use hmac::{Hmac, Mac};
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A COSE_Mac0 with a detached payload, as used for `DeviceMac`.
#[derive(Clone, Debug, PartialEq)]
pub struct CoseMac0(coset::CoseMac0);

impl CoseMac0 {
    pub fn new(inner: coset::CoseMac0) -> Self {
        Self(inner)
    }

    pub fn inner(&self) -> &coset::CoseMac0 {
        &self.0
    }

    /// HMAC 256/256 over the MAC_structure of `payload`, leaving the payload
    /// detached.
    pub fn create_detached(key: &[u8], payload: &[u8]) -> Result<Self, Error> {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::InvalidTag)?;
        let protected = HeaderBuilder::new().algorithm(mac.algorithm()).build();
        mac.update(&mac_data(
            coset::ProtectedHeader {
                original_data: None,
                header: protected.clone(),
            },
            payload,
        ));
        let tag = mac.finalize().into_bytes().to_vec();
        let inner = CoseMac0Builder::new().protected(protected).tag(tag).build();
        Ok(Self(inner))
    }

    pub fn verify_detached(&self, key: &[u8], payload: &[u8]) -> Result<(), Error> {
        match protected_algorithm(&self.0.protected)? {
            iana::Algorithm::HMAC_256_256 => {}
            other => return Err(Error::AlgorithmMismatch(other)),
        }
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::InvalidTag)?;
        mac.update(&mac_data(self.0.protected.clone(), payload));
        mac.verify_slice(&self.0.tag).map_err(|_| Error::InvalidTag)
    }
}

/// The MAC_structure for a COSE_Mac0 with no external AAD. A received header
/// keeps its original bytes.
fn mac_data(protected: coset::ProtectedHeader, payload: &[u8]) -> Vec<u8> {
    mac_structure_data(MacContext::CoseMac0, protected, &[], payload)
}

impl SignatureAlgorithm for HmacSha256 {
    fn algorithm(&self) -> iana::Algorithm {
        iana::Algorithm::HMAC_256_256
    }
}

impl Serialize for CoseMac0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0
            .clone()
            .to_cbor_value()
            .map_err(ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CoseMac0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let inner = coset::CoseMac0::from_cbor_value(value).map_err(de::Error::custom)?;
        Ok(CoseMac0(inner))
    }
}
