use ciborium::Value;
use coset::iana::Algorithm;
use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use serde::{Deserialize, Serialize};

/// An implementation of RFC-8152 [COSE_Key](https://datatracker.ietf.org/doc/html/rfc8152#section-13)
/// restricted to the EC2 keys used for session establishment and device authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum CoseKey {
    EC2 { crv: EC2Curve, x: Vec<u8>, y: EC2Y },
}

/// The sign bit or value of the y-coordinate for the EC point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EC2Y {
    Value(Vec<u8>),
    SignBit(bool),
}

/// The RFC-8152 identifier of the curve, for EC2 key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EC2Curve {
    P256,
    P384,
    P521,
}

/// Errors that can occur when deserialising or converting a COSE_Key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("COSE_Key of kty 'EC2' missing x coordinate")]
    EC2MissingX,
    #[error("COSE_Key of kty 'EC2' missing y coordinate")]
    EC2MissingY,
    #[error("Expected to parse a CBOR bool or bstr for y-coordinate, received: '{0:?}'")]
    InvalidTypeY(Value),
    #[error("Expected to parse a CBOR map, received: '{0:?}'")]
    NotAMap(Value),
    #[error("This implementation of COSE_Key only supports P-256, P-384 and P-521 elliptic curves")]
    UnsupportedCurve,
    #[error("This implementation of COSE_Key only supports EC2 keys")]
    UnsupportedKeyType,
    #[error("Could not reconstruct coordinates from the provided COSE_Key")]
    InvalidCoseKey,
}

impl CoseKey {
    pub fn curve(&self) -> EC2Curve {
        match self {
            CoseKey::EC2 { crv, .. } => *crv,
        }
    }

    pub fn signature_algorithm(&self) -> Option<Algorithm> {
        match self.curve() {
            EC2Curve::P256 => Some(Algorithm::ES256),
            EC2Curve::P384 => Some(Algorithm::ES384),
            EC2Curve::P521 => Some(Algorithm::ES512),
        }
    }

    /// SEC1 encoding of the point, compressed if the key only carries the sign bit.
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        match self {
            CoseKey::EC2 {
                x,
                y: EC2Y::Value(y),
                ..
            } => {
                let mut bytes = Vec::with_capacity(1 + x.len() + y.len());
                bytes.push(0x04);
                bytes.extend_from_slice(x);
                bytes.extend_from_slice(y);
                bytes
            }
            CoseKey::EC2 {
                x,
                y: EC2Y::SignBit(sign),
                ..
            } => {
                let mut bytes = Vec::with_capacity(1 + x.len());
                bytes.push(if *sign { 0x03 } else { 0x02 });
                bytes.extend_from_slice(x);
                bytes
            }
        }
    }
}

macro_rules! impl_from_public_key {
    ($public_key:ty, $crv:expr) => {
        impl From<&$public_key> for CoseKey {
            fn from(key: &$public_key) -> CoseKey {
                // Uncompressed points always carry both coordinates.
                let point = key.to_encoded_point(false);
                CoseKey::EC2 {
                    crv: $crv,
                    x: point.x().map(|x| x.to_vec()).unwrap_or_default(),
                    y: EC2Y::Value(point.y().map(|y| y.to_vec()).unwrap_or_default()),
                }
            }
        }
    };
}

impl_from_public_key!(p256::PublicKey, EC2Curve::P256);
impl_from_public_key!(p384::PublicKey, EC2Curve::P384);

impl TryFrom<&CoseKey> for p256::PublicKey {
    type Error = Error;

    fn try_from(key: &CoseKey) -> Result<Self, Error> {
        if key.curve() != EC2Curve::P256 {
            return Err(Error::UnsupportedCurve);
        }
        let point = p256::EncodedPoint::from_bytes(key.to_sec1_bytes())
            .map_err(|_| Error::InvalidCoseKey)?;
        Option::from(p256::PublicKey::from_encoded_point(&point)).ok_or(Error::InvalidCoseKey)
    }
}

impl TryFrom<&CoseKey> for p384::PublicKey {
    type Error = Error;

    fn try_from(key: &CoseKey) -> Result<Self, Error> {
        if key.curve() != EC2Curve::P384 {
            return Err(Error::UnsupportedCurve);
        }
        let point = p384::EncodedPoint::from_bytes(key.to_sec1_bytes())
            .map_err(|_| Error::InvalidCoseKey)?;
        Option::from(p384::PublicKey::from_encoded_point(&point)).ok_or(Error::InvalidCoseKey)
    }
}

impl From<CoseKey> for Value {
    fn from(key: CoseKey) -> Value {
        let CoseKey::EC2 { crv, x, y } = key;
        Value::Map(vec![
            // kty: 1, EC2: 2
            (Value::Integer(1.into()), Value::Integer(2.into())),
            // crv: -1
            (Value::Integer((-1).into()), crv.into()),
            // x: -2
            (Value::Integer((-2).into()), Value::Bytes(x)),
            // y: -3
            (Value::Integer((-3).into()), y.into()),
        ])
    }
}

impl TryFrom<Value> for CoseKey {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let entries = match v {
            Value::Map(entries) => entries,
            other => return Err(Error::NotAMap(other)),
        };
        let lookup = |label: i128| {
            entries
                .iter()
                .find(|(k, _)| matches!(k, Value::Integer(i) if i128::from(*i) == label))
                .map(|(_, v)| v.clone())
        };

        match lookup(1) {
            Some(Value::Integer(kty)) if i128::from(kty) == 2 => {}
            _ => return Err(Error::UnsupportedKeyType),
        }
        let crv = match lookup(-1) {
            Some(Value::Integer(crv)) => EC2Curve::try_from(i128::from(crv))?,
            _ => return Err(Error::UnsupportedCurve),
        };
        let x = match lookup(-2) {
            Some(Value::Bytes(x)) => x,
            _ => return Err(Error::EC2MissingX),
        };
        let y = lookup(-3).ok_or(Error::EC2MissingY)?.try_into()?;
        Ok(CoseKey::EC2 { crv, x, y })
    }
}

impl From<EC2Y> for Value {
    fn from(y: EC2Y) -> Value {
        match y {
            EC2Y::Value(s) => Value::Bytes(s),
            EC2Y::SignBit(b) => Value::Bool(b),
        }
    }
}

impl TryFrom<Value> for EC2Y {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Bytes(s) => Ok(EC2Y::Value(s)),
            Value::Bool(b) => Ok(EC2Y::SignBit(b)),
            _ => Err(Error::InvalidTypeY(v)),
        }
    }
}

impl From<EC2Curve> for Value {
    fn from(crv: EC2Curve) -> Value {
        match crv {
            EC2Curve::P256 => Value::Integer(1.into()),
            EC2Curve::P384 => Value::Integer(2.into()),
            EC2Curve::P521 => Value::Integer(3.into()),
        }
    }
}

impl TryFrom<i128> for EC2Curve {
    type Error = Error;

    fn try_from(crv_id: i128) -> Result<Self, Error> {
        match crv_id {
            1 => Ok(EC2Curve::P256),
            2 => Ok(EC2Curve::P384),
            3 => Ok(EC2Curve::P521),
            _ => Err(Error::UnsupportedCurve),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;
    use rand::rngs::OsRng;

    #[test]
    fn cose_key() {
        let key = CoseKey::EC2 {
            crv: EC2Curve::P256,
            x: vec![0x01, 0x02, 0x03],
            y: EC2Y::Value(vec![0x04, 0x05, 0x06]),
        };
        let bytes = cbor::to_vec(&key).unwrap();
        let key2: CoseKey = cbor::from_slice(&bytes).unwrap();
        assert_eq!(key, key2);
    }

    #[test]
    fn p256_public_key_conversion() {
        let secret = p256::SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        let cose_key = CoseKey::from(&public);
        assert_eq!(cose_key.curve(), EC2Curve::P256);
        let back = p256::PublicKey::try_from(&cose_key).unwrap();
        assert_eq!(back, public);
        assert!(p384::PublicKey::try_from(&cose_key).is_err());
    }

    #[test]
    fn okp_keys_are_unsupported() {
        let okp = Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(1.into())),
            (Value::Integer((-1).into()), Value::Integer(6.into())),
            (Value::Integer((-2).into()), Value::Bytes(vec![0; 32])),
        ]);
        assert!(matches!(
            CoseKey::try_from(okp),
            Err(Error::UnsupportedKeyType)
        ));
    }
}
