//! Device-signed data and the device authentication structure that binds a
//! response to its session.
use crate::cose::{CoseMac0, CoseSign1};
use crate::definitions::{
    helpers::{NonEmptyMap, Tag24},
    session::{self, SessionTranscript},
};
use ciborium::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSigned {
    #[serde(rename = "nameSpaces")]
    pub namespaces: DeviceNamespacesBytes,
    pub device_auth: DeviceAuth,
}

pub type DeviceNamespacesBytes = Tag24<DeviceNamespaces>;
pub type DeviceNamespaces = BTreeMap<String, DeviceSignedItems>;
pub type DeviceSignedItems = NonEmptyMap<String, Value>;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum DeviceAuth {
    DeviceSignature(CoseSign1),
    DeviceMac(CoseMac0),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceAuthType {
    Sign1,
    Mac0,
}

/// `["DeviceAuthentication", SessionTranscript, DocType, DeviceNameSpacesBytes]`
#[derive(Clone, Debug, Serialize)]
pub struct DeviceAuthentication(&'static str, SessionTranscript, String, DeviceNamespacesBytes);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to encode value as CBOR: {0}")]
    UnableToEncode(#[from] crate::definitions::helpers::tag24::Error),
    #[error(transparent)]
    Session(#[from] session::Error),
}

impl DeviceAuthentication {
    pub fn new(
        transcript: SessionTranscript,
        doc_type: String,
        namespaces_bytes: DeviceNamespacesBytes,
    ) -> Self {
        Self(
            "DeviceAuthentication",
            transcript,
            doc_type,
            namespaces_bytes,
        )
    }

    /// `DeviceAuthenticationBytes`: the detached payload for both the device
    /// signature and the device MAC.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(Tag24::new(self.clone())?.to_tagged_bytes()?)
    }
}

impl DeviceAuth {
    pub fn auth_type(&self) -> DeviceAuthType {
        match self {
            DeviceAuth::DeviceSignature(_) => DeviceAuthType::Sign1,
            DeviceAuth::DeviceMac(_) => DeviceAuthType::Mac0,
        }
    }
}

/// `EMacKey`: HKDF over the ECDH of the device key and the reader's ephemeral
/// key, salted with the hash of the session transcript bytes.
pub fn emac_key(
    shared_secret: &[u8],
    transcript: &SessionTranscript,
) -> Result<[u8; 32], Error> {
    let transcript_bytes = transcript.to_bytes()?;
    Ok(session::derive_key(shared_secret, &transcript_bytes, "EMacKey")?)
}

/// The device-signed part of a response that discloses no device-signed
/// elements.
pub fn empty_namespaces() -> Result<DeviceNamespacesBytes, Error> {
    Ok(Tag24::new(DeviceNamespaces::new())?)
}
