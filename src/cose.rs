//! COSE structures carried inside mdoc messages.
//!
//! Both wrappers serialize as their untagged COSE array form through
//! [coset::AsCborValue], so they can sit directly in serde-derived structs.
pub mod mac0;
pub mod sign1;

use coset::iana;

pub use mac0::CoseMac0;
pub use sign1::{CoseSign1, PreparedCoseSign1};

/// Trait to represent the signature algorithm of a signer or verifier.
pub trait SignatureAlgorithm {
    fn algorithm(&self) -> iana::Algorithm;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("COSE structure is missing an algorithm in its protected header")]
    MissingAlgorithm,
    #[error("algorithm {0:?} does not match the verification key")]
    AlgorithmMismatch(iana::Algorithm),
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("COSE structure carries no payload")]
    MissingPayload,
    #[error("malformed signature bytes")]
    MalformedSignature,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("MAC tag verification failed")]
    InvalidTag,
    #[error("invalid verification key: {0}")]
    InvalidKey(#[from] crate::definitions::device_key::cose_key::Error),
}

fn protected_algorithm(header: &coset::ProtectedHeader) -> Result<iana::Algorithm, Error> {
    match &header.header.alg {
        Some(coset::RegisteredLabelWithPrivate::Assigned(alg)) => Ok(*alg),
        Some(_) => Err(Error::UnsupportedAlgorithm),
        None => Err(Error::MissingAlgorithm),
    }
}

mod p256 {
    use super::SignatureAlgorithm;
    use coset::iana;
    use p256::ecdsa::{SigningKey, VerifyingKey};

    impl SignatureAlgorithm for SigningKey {
        fn algorithm(&self) -> iana::Algorithm {
            iana::Algorithm::ES256
        }
    }

    impl SignatureAlgorithm for VerifyingKey {
        fn algorithm(&self) -> iana::Algorithm {
            iana::Algorithm::ES256
        }
    }
}

mod p384 {
    use super::SignatureAlgorithm;
    use coset::iana;
    use p384::ecdsa::{SigningKey, VerifyingKey};

    impl SignatureAlgorithm for SigningKey {
        fn algorithm(&self) -> iana::Algorithm {
            iana::Algorithm::ES384
        }
    }

    impl SignatureAlgorithm for VerifyingKey {
        fn algorithm(&self) -> iana::Algorithm {
            iana::Algorithm::ES384
        }
    }
}
