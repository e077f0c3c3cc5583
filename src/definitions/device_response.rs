use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString, EnumVariantNames};
use thiserror::Error;

use crate::definitions::{
    helpers::{NonEmptyMap, NonEmptyVec},
    DeviceSigned, IssuerSigned,
};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Documents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_errors: Option<DocumentErrors>,
    pub status: Status,
}

pub type Documents = NonEmptyVec<Document>;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub doc_type: String,
    pub issuer_signed: IssuerSigned,
    pub device_signed: DeviceSigned,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Errors>,
}

/// Errors mapped by namespace and element identifier.
pub type Errors = NonEmptyMap<String, NonEmptyMap<String, DocumentErrorCode>>;
/// A list of document errors.
pub type DocumentErrors = NonEmptyVec<DocumentError>;
/// A map of document type to document error for them.
pub type DocumentError = BTreeMap<String, DocumentErrorCode>;

/// Document specific errors.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "i64", into = "i64")]
pub enum DocumentErrorCode {
    DataNotReturned,
    ApplicationSpecific(i64),
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, EnumString, EnumVariantNames, AsRefStr, PartialEq, Eq,
)]
#[serde(try_from = "u64", into = "u64")]
pub enum Status {
    OK = 0,
    GeneralError = 10,
    CborDecodingError = 11,
    CborValidationError = 12,
}

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("invalid status value {0}")]
    InvalidValue(u64),
}

impl DeviceResponse {
    pub const VERSION: &'static str = "1.0";

    /// A response with no documents, only a status.
    pub fn empty(status: Status) -> Self {
        DeviceResponse {
            version: Self::VERSION.into(),
            documents: None,
            document_errors: None,
            status,
        }
    }
}

impl Document {
    /// Build the per-element error map from the identifiers a credential
    /// could not supply, per namespace.
    pub fn errors_for(missing: BTreeMap<String, Vec<String>>) -> Option<Errors> {
        let errors = missing
            .into_iter()
            .filter_map(|(namespace, elements)| {
                let elements = elements
                    .into_iter()
                    .map(|element| (element, DocumentErrorCode::DataNotReturned))
                    .collect();
                NonEmptyMap::maybe_new(elements).map(|elements| (namespace, elements))
            })
            .collect();
        NonEmptyMap::maybe_new(errors)
    }
}

impl From<i64> for DocumentErrorCode {
    fn from(code: i64) -> Self {
        match code {
            0 => DocumentErrorCode::DataNotReturned,
            i => DocumentErrorCode::ApplicationSpecific(i),
        }
    }
}

impl From<DocumentErrorCode> for i64 {
    fn from(code: DocumentErrorCode) -> i64 {
        match code {
            DocumentErrorCode::DataNotReturned => 0,
            DocumentErrorCode::ApplicationSpecific(i) => i,
        }
    }
}

impl From<Status> for u64 {
    fn from(status: Status) -> u64 {
        status as u64
    }
}

impl TryFrom<u64> for Status {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::OK),
            10 => Ok(Status::GeneralError),
            11 => Ok(Status::CborDecodingError),
            12 => Ok(Status::CborValidationError),
            _ => Err(Error::InvalidValue(value)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;

    #[test]
    fn empty_response_roundtrip() {
        let mut document_errors = DocumentError::new();
        document_errors.insert("doc.B".into(), DocumentErrorCode::DataNotReturned);
        let response = DeviceResponse {
            document_errors: NonEmptyVec::maybe_new(vec![document_errors]),
            ..DeviceResponse::empty(Status::OK)
        };
        let bytes = cbor::to_vec(&response).unwrap();
        let decoded: DeviceResponse = cbor::from_slice(&bytes).unwrap();
        assert_eq!(decoded, response);
        assert!(decoded.documents.is_none());
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(Status::try_from(3).is_err());
        assert_eq!(u64::from(Status::CborDecodingError), 11);
    }

    #[test]
    fn element_errors() {
        let missing = BTreeMap::from([
            ("doc.A.ns".to_string(), vec!["age".to_string()]),
            ("doc.A.empty".to_string(), vec![]),
        ]);
        let errors = Document::errors_for(missing).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors["doc.A.ns"]["age"],
            DocumentErrorCode::DataNotReturned
        );
        assert!(Document::errors_for(BTreeMap::new()).is_none());
    }
}
