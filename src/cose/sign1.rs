use super::{protected_algorithm, Error, SignatureAlgorithm};
use crate::definitions::device_key::{cose_key::EC2Curve, CoseKey};
use coset::{cbor::Value, iana, AsCborValue, CoseSign1Builder, HeaderBuilder};
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use signature::{SignatureEncoding, Signer, Verifier};

/// A COSE_Sign1, either with an attached payload (`issuerAuth`) or detached
/// (`DeviceSignature`).
#[derive(Clone, Debug, PartialEq)]
pub struct CoseSign1(coset::CoseSign1);

/// A COSE_Sign1 whose to-be-signed bytes have been computed but whose
/// signature is still pending, for signers that live behind an async or
/// fallible boundary such as a secure key store.
#[derive(Clone, Debug)]
pub struct PreparedCoseSign1 {
    inner: coset::CoseSign1,
    tbs: Vec<u8>,
}

impl CoseSign1 {
    pub fn new(inner: coset::CoseSign1) -> Self {
        Self(inner)
    }

    pub fn inner(&self) -> &coset::CoseSign1 {
        &self.0
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.0.payload.as_deref()
    }

    pub fn algorithm(&self) -> Result<iana::Algorithm, Error> {
        protected_algorithm(&self.0.protected)
    }

    /// Sign `payload` in place with an in-memory signer, embedding it.
    pub fn sign<S, Sig>(signer: &S, payload: Vec<u8>) -> Self
    where
        S: Signer<Sig> + SignatureAlgorithm,
        Sig: SignatureEncoding,
    {
        let prepared = PreparedCoseSign1::new(signer.algorithm(), payload, true);
        let signature = signer.sign(prepared.signature_payload()).to_vec();
        prepared.finalize(signature)
    }

    /// Verify the embedded payload against `key`.
    pub fn verify(&self, key: &CoseKey) -> Result<(), Error> {
        let alg = self.algorithm()?;
        if self.0.payload.is_none() {
            return Err(Error::MissingPayload);
        }
        self.0
            .verify_signature(&[], |sig, data| verify_with_key(key, alg, sig, data))
    }

    /// Verify a detached signature over `payload` against `key`.
    pub fn verify_detached(&self, payload: &[u8], key: &CoseKey) -> Result<(), Error> {
        let alg = self.algorithm()?;
        self.0
            .verify_detached_signature(payload, &[], |sig, data| {
                verify_with_key(key, alg, sig, data)
            })
    }
}

impl PreparedCoseSign1 {
    /// Compute the Sig_structure for `payload`, keeping it in the final
    /// structure only if `attach` is set.
    pub fn new(alg: iana::Algorithm, payload: Vec<u8>, attach: bool) -> Self {
        let protected = HeaderBuilder::new().algorithm(alg).build();
        let mut inner = CoseSign1Builder::new().protected(protected).build();
        // The Sig_structure is the same either way, but coset only computes
        // it over a detached payload.
        let tbs = inner.tbs_detached_data(&payload, &[]);
        if attach {
            inner.payload = Some(payload);
        }
        Self { inner, tbs }
    }

    pub fn signature_payload(&self) -> &[u8] {
        &self.tbs
    }

    pub fn finalize(self, signature: Vec<u8>) -> CoseSign1 {
        let mut inner = self.inner;
        inner.signature = signature;
        CoseSign1(inner)
    }
}

fn verify_with_key(
    key: &CoseKey,
    alg: iana::Algorithm,
    signature: &[u8],
    data: &[u8],
) -> Result<(), Error> {
    match (key.curve(), alg) {
        (EC2Curve::P256, iana::Algorithm::ES256) => {
            let public_key = p256::PublicKey::try_from(key)?;
            let signature = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|_| Error::MalformedSignature)?;
            p256::ecdsa::VerifyingKey::from(&public_key)
                .verify(data, &signature)
                .map_err(|_| Error::InvalidSignature)
        }
        (EC2Curve::P384, iana::Algorithm::ES384) => {
            let public_key = p384::PublicKey::try_from(key)?;
            let signature = p384::ecdsa::Signature::from_slice(signature)
                .map_err(|_| Error::MalformedSignature)?;
            p384::ecdsa::VerifyingKey::from(&public_key)
                .verify(data, &signature)
                .map_err(|_| Error::InvalidSignature)
        }
        (_, alg) => Err(Error::AlgorithmMismatch(alg)),
    }
}

impl Serialize for CoseSign1 {
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

impl<'de> Deserialize<'de> for CoseSign1 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let inner = coset::CoseSign1::from_cbor_value(value).map_err(de::Error::custom)?;
        Ok(CoseSign1(inner))
    }
}
