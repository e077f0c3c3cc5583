use crate::cose::CoseSign1;
use crate::definitions::helpers::{NonEmptyMap, NonEmptyVec, Tag24};
use ciborium::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ItemsRequestBytes = Tag24<ItemsRequest>;
pub type DocType = String;
pub type NameSpace = String;
pub type IntentToRetain = bool;
pub type DataElementIdentifier = String;
pub type DataElements = NonEmptyMap<DataElementIdentifier, IntentToRetain>;
pub type Namespaces = NonEmptyMap<NameSpace, DataElements>;
pub type ReaderAuth = CoseSign1;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub version: String,
    pub doc_requests: NonEmptyVec<DocRequest>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocRequest {
    pub items_request: ItemsRequestBytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_auth: Option<ReaderAuth>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemsRequest {
    pub doc_type: DocType,
    #[serde(rename = "nameSpaces")]
    pub namespaces: Namespaces,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_info: Option<BTreeMap<String, Value>>,
}

impl DeviceRequest {
    pub const VERSION: &'static str = "1.0";
}

impl DocRequest {
    pub fn doc_type(&self) -> &str {
        &self.items_request.as_ref().doc_type
    }

    /// Requested element identifiers per namespace, in encoding order.
    pub fn requested_elements(&self) -> BTreeMap<String, Vec<String>> {
        self.items_request
            .as_ref()
            .namespaces
            .iter()
            .map(|(namespace, elements)| (namespace.clone(), elements.keys().cloned().collect()))
            .collect()
    }
}
