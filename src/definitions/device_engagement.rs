//! Device engagement: the first structure a holder hands to a verifier, out of
//! band, usually as a QR code.
//!
//! It carries the holder's ephemeral public key (`EDeviceKeyBytes`) and the
//! BLE retrieval options the verifier needs to find the holder's service. Only
//! the BLE retrieval method is understood here; any other method is rejected
//! as unsupported.
use std::collections::BTreeMap;

use ciborium::Value;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::cbor::{self, CborError};
use crate::definitions::helpers::{ByteStr, NonEmptyVec, Tag24};
use crate::definitions::CoseKey;

pub type EDeviceKeyBytes = Tag24<CoseKey>;
pub type DeviceEngagementBytes = Tag24<DeviceEngagement>;
pub type DeviceRetrievalMethods = NonEmptyVec<DeviceRetrievalMethod>;

/// Cipher suite 1: ECDH, HKDF-SHA256 and AES-256-GCM.
pub const CIPHER_SUITE: u64 = 1;

const BASE64_CONFIG: base64::Config = base64::Config::new(base64::CharacterSet::UrlSafe, false);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub struct DeviceEngagement {
    pub version: String,
    pub security: Security,
    pub device_retrieval_methods: Option<DeviceRetrievalMethods>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum DeviceRetrievalMethod {
    BLE(BleOptions),
}

/// Cipher suite identifier and the holder's ephemeral key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Security(pub u64, pub EDeviceKeyBytes);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub struct BleOptions {
    pub peripheral_server_mode: Option<PeripheralServerMode>,
    pub central_client_mode: Option<CentralClientMode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeripheralServerMode {
    pub uuid: Uuid,
    pub ble_device_address: Option<ByteStr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CentralClientMode {
    pub uuid: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Expected device engagement version 1.0")]
    UnsupportedVersion,
    #[error("Unsupported cipher suite {0}")]
    UnsupportedCipherSuite(u64),
    #[error("Unsupported device retrieval method")]
    UnsupportedDRM,
    #[error("Malformed object not recognised")]
    Malformed,
    #[error("QR code URI must start with 'mdoc:'")]
    InvalidQrPrefix,
    #[error("QR code URI payload is not base64url: {0}")]
    InvalidQrEncoding(#[from] base64::DecodeError),
    #[error("Unable to decode the device engagement: {0}")]
    Tag24(#[from] crate::definitions::helpers::tag24::Error),
    #[error("Unable to encode the ephemeral device key: {0}")]
    Cbor(#[from] CborError),
    #[error("Unable to derive BLE identity: {0}")]
    Hkdf(String),
}

impl DeviceEngagement {
    pub const VERSION: &'static str = "1.0";

    pub fn new(e_device_key: EDeviceKeyBytes, ble: BleOptions) -> Self {
        Self {
            version: Self::VERSION.into(),
            security: Security(CIPHER_SUITE, e_device_key),
            device_retrieval_methods: Some(NonEmptyVec::new(DeviceRetrievalMethod::BLE(ble))),
        }
    }

    pub fn e_device_key(&self) -> &EDeviceKeyBytes {
        &self.security.1
    }

    /// The first BLE retrieval method advertised, if any.
    pub fn ble_options(&self) -> Option<&BleOptions> {
        self.device_retrieval_methods
            .as_ref()?
            .iter()
            .map(|method| match method {
                DeviceRetrievalMethod::BLE(options) => options,
            })
            .next()
    }
}

impl Tag24<DeviceEngagement> {
    pub fn to_qr_code_uri(&self) -> String {
        let mut qr_code_uri = String::from("mdoc:");
        base64::encode_config_buf(&self.inner_bytes, BASE64_CONFIG, &mut qr_code_uri);
        qr_code_uri
    }

    pub fn from_qr_code_uri(qr_code_uri: &str) -> Result<Self, Error> {
        let encoded_de = qr_code_uri
            .strip_prefix("mdoc:")
            .ok_or(Error::InvalidQrPrefix)?;
        let decoded_de = base64::decode_config(encoded_de, BASE64_CONFIG)?;
        Ok(Tag24::<DeviceEngagement>::from_bytes(decoded_de)?)
    }
}

/// The value the holder exposes on the identity characteristic:
/// `HKDF-SHA256(EDeviceKeyBytes, info = "BLEIdent")`, 16 bytes.
pub fn ble_ident(e_device_key: &EDeviceKeyBytes) -> Result<[u8; 16], Error> {
    let e_device_key_bytes = cbor::to_vec(e_device_key)?;
    let mut ble_ident = [0u8; 16];
    Hkdf::<Sha256>::new(None, &e_device_key_bytes)
        .expand("BLEIdent".as_bytes(), &mut ble_ident)
        .map_err(|e| Error::Hkdf(e.to_string()))?;
    Ok(ble_ident)
}

fn integer_keyed(map: Vec<(Value, Value)>) -> Result<BTreeMap<i128, Value>, Error> {
    map.into_iter()
        .map(|(k, v)| Ok((k.into_integer().map_err(|_| Error::Malformed)?.into(), v)))
        .collect()
}

impl From<DeviceEngagement> for Value {
    fn from(device_engagement: DeviceEngagement) -> Value {
        let Security(cipher_suite, e_device_key) = device_engagement.security;
        let mut map = vec![
            (
                Value::Integer(0.into()),
                Value::Text(device_engagement.version),
            ),
            (
                Value::Integer(1.into()),
                Value::Array(vec![
                    Value::Integer(cipher_suite.into()),
                    Value::from(e_device_key),
                ]),
            ),
        ];
        if let Some(methods) = device_engagement.device_retrieval_methods {
            map.push((
                Value::Integer(2.into()),
                Value::Array(methods.into_inner().into_iter().map(Value::from).collect()),
            ));
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for DeviceEngagement {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let mut map = match v {
            Value::Map(map) => integer_keyed(map)?,
            _ => return Err(Error::Malformed),
        };
        match map.remove(&0) {
            Some(Value::Text(version)) if version == Self::VERSION => {}
            Some(Value::Text(_)) => return Err(Error::UnsupportedVersion),
            _ => return Err(Error::Malformed),
        }
        let security: Security =
            cbor::from_value(map.remove(&1).ok_or(Error::Malformed)?).map_err(|_| Error::Malformed)?;
        if security.0 != CIPHER_SUITE {
            return Err(Error::UnsupportedCipherSuite(security.0));
        }
        let device_retrieval_methods = match map.remove(&2) {
            Some(Value::Array(methods)) => {
                let methods = methods
                    .into_iter()
                    .map(DeviceRetrievalMethod::try_from)
                    .collect::<Result<Vec<_>, Error>>()?;
                Some(NonEmptyVec::try_from(methods).map_err(|_| Error::Malformed)?)
            }
            Some(_) => return Err(Error::Malformed),
            None => None,
        };
        Ok(DeviceEngagement {
            version: Self::VERSION.into(),
            security,
            device_retrieval_methods,
        })
    }
}

impl From<DeviceRetrievalMethod> for Value {
    fn from(drm: DeviceRetrievalMethod) -> Value {
        match drm {
            // type 2 (BLE), version 1
            DeviceRetrievalMethod::BLE(options) => Value::Array(vec![
                Value::Integer(2.into()),
                Value::Integer(1.into()),
                Value::from(options),
            ]),
        }
    }
}

impl TryFrom<Value> for DeviceRetrievalMethod {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        let list = match value {
            Value::Array(list) => list,
            _ => return Err(Error::Malformed),
        };
        match <[Value; 3]>::try_from(list) {
            Ok([Value::Integer(transport), Value::Integer(version), options])
                if i128::from(transport) == 2 && i128::from(version) == 1 =>
            {
                Ok(DeviceRetrievalMethod::BLE(BleOptions::try_from(options)?))
            }
            Ok([Value::Integer(_), _, _]) => Err(Error::UnsupportedDRM),
            _ => Err(Error::Malformed),
        }
    }
}

fn uuid_from(value: Option<Value>) -> Result<Uuid, Error> {
    match value {
        Some(Value::Bytes(bytes)) => {
            let bytes: [u8; 16] = bytes.try_into().map_err(|_| Error::Malformed)?;
            Ok(Uuid::from_bytes(bytes))
        }
        _ => Err(Error::Malformed),
    }
}

impl TryFrom<Value> for BleOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let mut map = match v {
            Value::Map(map) => integer_keyed(map)?,
            _ => return Err(Error::Malformed),
        };
        let peripheral_server_mode = match map.remove(&0) {
            Some(Value::Bool(true)) => Some(PeripheralServerMode {
                uuid: uuid_from(map.remove(&10))?,
                ble_device_address: match map.remove(&20) {
                    Some(Value::Bytes(address)) => Some(address.into()),
                    Some(_) => return Err(Error::Malformed),
                    None => None,
                },
            }),
            Some(Value::Bool(false)) => None,
            _ => return Err(Error::Malformed),
        };
        let central_client_mode = match map.remove(&1) {
            Some(Value::Bool(true)) => Some(CentralClientMode {
                uuid: uuid_from(map.remove(&11))?,
            }),
            Some(Value::Bool(false)) => None,
            _ => return Err(Error::Malformed),
        };
        Ok(BleOptions {
            peripheral_server_mode,
            central_client_mode,
        })
    }
}

impl From<BleOptions> for Value {
    fn from(o: BleOptions) -> Value {
        let mut map = vec![
            (
                Value::Integer(0.into()),
                Value::Bool(o.peripheral_server_mode.is_some()),
            ),
            (
                Value::Integer(1.into()),
                Value::Bool(o.central_client_mode.is_some()),
            ),
        ];
        if let Some(PeripheralServerMode {
            uuid,
            ble_device_address,
        }) = o.peripheral_server_mode
        {
            map.push((
                Value::Integer(10.into()),
                Value::Bytes(uuid.as_bytes().to_vec()),
            ));
            if let Some(address) = ble_device_address {
                map.push((Value::Integer(20.into()), Value::Bytes(address.into())));
            }
        }
        if let Some(CentralClientMode { uuid }) = o.central_client_mode {
            map.push((
                Value::Integer(11.into()),
                Value::Bytes(uuid.as_bytes().to_vec()),
            ));
        }
        Value::Map(map)
    }
}
