//! Issuer-signed data: the disclosed elements plus the `issuerAuth` COSE_Sign1
//! whose payload is the [Mso](crate::definitions::mso::Mso).
//!
//! Each disclosed element travels as an [IssuerSignedItemBytes], a tag 24
//! embedded item whose exact bytes are digested into the MSO. Filtering a
//! credential down to a request therefore only ever drops whole items and
//! never re-encodes the ones that remain.
use crate::cose::CoseSign1;
use crate::definitions::{
    helpers::{ByteStr, NonEmptyMap, NonEmptyVec, Tag24},
    mso::{DigestAlgorithm, DigestId, Mso},
};
use ciborium::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSigned {
    #[serde(skip_serializing_if = "Option::is_none", rename = "nameSpaces")]
    pub namespaces: Option<IssuerNamespaces>,
    pub issuer_auth: CoseSign1,
}

pub type IssuerNamespaces = NonEmptyMap<String, NonEmptyVec<IssuerSignedItemBytes>>;
pub type IssuerSignedItemBytes = Tag24<IssuerSignedItem>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSignedItem {
    #[serde(rename = "digestID")]
    pub digest_id: DigestId,
    pub random: ByteStr,
    pub element_identifier: String,
    pub element_value: Value,
}

impl IssuerSigned {
    /// Keep only the requested elements. Returns the filtered structure and,
    /// per namespace, the requested identifiers the credential does not hold.
    pub fn filter(
        &self,
        requested: &BTreeMap<String, Vec<String>>,
    ) -> (IssuerSigned, BTreeMap<String, Vec<String>>) {
        let mut kept = BTreeMap::new();
        let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (namespace, elements) in requested {
            let available = self
                .namespaces
                .as_ref()
                .and_then(|namespaces| namespaces.get(namespace));
            let mut items = Vec::new();
            for element in elements {
                match available.and_then(|items| {
                    items
                        .iter()
                        .find(|item| &item.as_ref().element_identifier == element)
                }) {
                    Some(item) => items.push(item.clone()),
                    None => missing
                        .entry(namespace.clone())
                        .or_default()
                        .push(element.clone()),
                }
            }
            if let Some(items) = NonEmptyVec::maybe_new(items) {
                kept.insert(namespace.clone(), items);
            }
        }
        let filtered = IssuerSigned {
            namespaces: NonEmptyMap::maybe_new(kept),
            issuer_auth: self.issuer_auth.clone(),
        };
        (filtered, missing)
    }

    /// Element identifiers held per namespace.
    pub fn element_identifiers(&self) -> BTreeMap<String, Vec<String>> {
        self.namespaces
            .iter()
            .flat_map(|namespaces| namespaces.iter())
            .map(|(namespace, items)| {
                (
                    namespace.clone(),
                    items
                        .iter()
                        .map(|item| item.as_ref().element_identifier.clone())
                        .collect(),
                )
            })
            .collect()
    }
}

impl IssuerSignedItemBytes {
    /// Whether the digest of this item's tag 24 encoding matches `mso`.
    pub fn matches_digest(&self, namespace: &str, mso: &Mso) -> bool {
        let expected = match mso.digest_for(namespace, self.as_ref().digest_id) {
            Some(digest) => digest,
            None => return false,
        };
        self.digest(mso.digest_algorithm)
            .map(|digest| digest == expected.as_ref())
            .unwrap_or(false)
    }

    pub fn digest(&self, algorithm: DigestAlgorithm) -> Option<Vec<u8>> {
        self.to_tagged_bytes()
            .ok()
            .map(|bytes| algorithm.digest(&bytes))
    }
}
