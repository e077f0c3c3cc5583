//! Wire structures exchanged during proximity presentment, with their CBOR
//! encodings.
pub mod device_engagement;
pub mod device_key;
pub mod device_request;
pub mod device_response;
pub mod device_signed;
pub mod helpers;
pub mod issuer_signed;
pub mod mso;
pub mod session;
pub mod validity_info;

pub use device_engagement::{
    BleOptions, CentralClientMode, DeviceEngagement, DeviceRetrievalMethod, PeripheralServerMode,
    Security,
};
pub use device_key::cose_key::{EC2Curve, EC2Y};
pub use device_key::{CoseKey, DeviceKeyInfo, KeyAuthorizations};
pub use device_request::{DeviceRequest, DocRequest, ItemsRequest};
pub use device_response::{DeviceResponse, Document};
pub use device_signed::{DeviceAuth, DeviceAuthType, DeviceAuthentication, DeviceSigned};
pub use issuer_signed::{IssuerSigned, IssuerSignedItem};
pub use mso::{DigestAlgorithm, DigestId, DigestIds, Mso};
pub use session::{
    Direction, EphemeralSecret, Handover, SessionCipher, SessionData, SessionEstablishment,
    SessionTranscript,
};
pub use validity_info::ValidityInfo;
