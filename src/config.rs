//! Session configuration.
//!
//! A [SessionConfig] is fixed for the lifetime of a session. It can be built
//! in code or loaded from JSON:
//!
//! ```json
//! {
//!   "role": "holder",
//!   "topology": "peripheral_server_mode",
//!   "service_uuid": "45efef74-2b2c-4837-a9a3-b0e1d05a6917"
//! }
//! ```
//!
//! Topologies may also be given by their BLE options code (`0` for
//! peripheral server mode, `1` for central client mode).
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown role '{0}'")]
    UnknownRole(String),
    #[error("unknown topology '{0}'")]
    UnknownTopology(String),
    #[error("unknown topology code {0}")]
    UnknownTopologyCode(u64),
    #[error("chunk size {0} is too small, a chunk carries a marker and at least one payload byte")]
    ChunkSizeTooSmall(usize),
    #[error("pending and last chunk markers must differ")]
    MarkersCollide,
    #[error("retry policy must allow at least one attempt")]
    NoAttempts,
    #[error("session is configured for the {0:?} role")]
    WrongRole(Role),
    #[error("unable to parse session configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which side of the exchange this device is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(try_from = "String", into = "String")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Role {
    Holder,
    Verifier,
}

/// Which side advertises the BLE service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(try_from = "TopologyRepr", into = "String")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Topology {
    /// The holder scans and connects to a service advertised by the verifier.
    CentralClientMode,
    /// The holder advertises a service the verifier connects to.
    PeripheralServerMode,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TopologyRepr {
    Code(u64),
    Name(String),
}

/// Marker bytes prefixed to every chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkMarkers {
    pub pending: u8,
    pub last: u8,
}

/// Bounded exponential backoff for radio writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSessionConfig")]
pub struct SessionConfig {
    pub role: Role,
    pub topology: Topology,
    pub service_uuid: Uuid,
    /// Size of one characteristic write, marker included.
    pub chunk_size: usize,
    pub chunk_markers: ChunkMarkers,
    pub retry: RetryPolicy,
    pub allow_multiple_requests: bool,
    pub prefer_signature: bool,
    pub max_unlock_attempts: u32,
}

/// The configuration as written, before role and topology are resolved.
#[derive(Deserialize)]
struct RawSessionConfig {
    role: String,
    topology: TopologyRepr,
    service_uuid: Uuid,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default)]
    chunk_markers: ChunkMarkers,
    #[serde(default)]
    retry: RetryPolicy,
    #[serde(default)]
    allow_multiple_requests: bool,
    #[serde(default)]
    prefer_signature: bool,
    #[serde(default = "default_max_unlock_attempts")]
    max_unlock_attempts: u32,
}

fn default_chunk_size() -> usize {
    // Default ATT MTU of 23 less the 3 byte write header.
    20
}

fn default_max_unlock_attempts() -> u32 {
    3
}

impl SessionConfig {
    pub fn new(role: Role, topology: Topology, service_uuid: Uuid) -> Self {
        Self {
            role,
            topology,
            service_uuid,
            chunk_size: default_chunk_size(),
            chunk_markers: ChunkMarkers::default(),
            retry: RetryPolicy::default(),
            allow_multiple_requests: false,
            prefer_signature: false,
            max_unlock_attempts: default_max_unlock_attempts(),
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let raw: RawSessionConfig = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size < 2 {
            return Err(Error::ChunkSizeTooSmall(self.chunk_size));
        }
        if self.chunk_markers.pending == self.chunk_markers.last {
            return Err(Error::MarkersCollide);
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::NoAttempts);
        }
        Ok(())
    }

    /// Payload bytes carried by one chunk.
    pub fn chunk_payload_size(&self) -> usize {
        self.chunk_size.saturating_sub(1)
    }
}

impl TryFrom<RawSessionConfig> for SessionConfig {
    type Error = Error;

    fn try_from(raw: RawSessionConfig) -> Result<Self, Error> {
        let config = Self {
            role: Role::parse(&raw.role)?,
            topology: Topology::try_from(raw.topology)?,
            service_uuid: raw.service_uuid,
            chunk_size: raw.chunk_size,
            chunk_markers: raw.chunk_markers,
            retry: raw.retry,
            allow_multiple_requests: raw.allow_multiple_requests,
            prefer_signature: raw.prefer_signature,
            max_unlock_attempts: raw.max_unlock_attempts,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for ChunkMarkers {
    fn default() -> Self {
        Self {
            pending: 0x00,
            last: 0x01,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

impl Role {
    pub fn parse(s: &str) -> Result<Self, Error> {
        Role::from_str(s).map_err(|_| Error::UnknownRole(s.to_string()))
    }
}

impl Topology {
    pub fn parse(s: &str) -> Result<Self, Error> {
        Topology::from_str(s).map_err(|_| Error::UnknownTopology(s.to_string()))
    }

    /// Map a BLE options key to a topology.
    pub fn from_code(code: u64) -> Result<Self, Error> {
        match code {
            0 => Ok(Topology::PeripheralServerMode),
            1 => Ok(Topology::CentralClientMode),
            _ => Err(Error::UnknownTopologyCode(code)),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Role::parse(&s)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> String {
        role.as_ref().to_string()
    }
}

impl TryFrom<TopologyRepr> for Topology {
    type Error = Error;

    fn try_from(repr: TopologyRepr) -> Result<Self, Self::Error> {
        match repr {
            TopologyRepr::Code(code) => Topology::from_code(code),
            TopologyRepr::Name(name) => Topology::parse(&name),
        }
    }
}

impl From<Topology> for String {
    fn from(topology: Topology) -> String {
        topology.as_ref().to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SERVICE: &str = "45efef74-2b2c-4837-a9a3-b0e1d05a6917";

    #[test]
    fn defaults_from_minimal_json() {
        let config = SessionConfig::from_json(&format!(
            r#"{{"role": "holder", "topology": "peripheral_server_mode", "service_uuid": "{SERVICE}"}}"#
        ))
        .unwrap();
        assert_eq!(config.role, Role::Holder);
        assert_eq!(config.topology, Topology::PeripheralServerMode);
        assert_eq!(config.chunk_markers, ChunkMarkers { pending: 0, last: 1 });
        assert!(!config.allow_multiple_requests);
        assert!(!config.prefer_signature);
        assert_eq!(config.max_unlock_attempts, 3);
        assert_eq!(config.chunk_payload_size(), 19);
    }

    #[test]
    fn topology_by_code() {
        let config = SessionConfig::from_json(&format!(
            r#"{{"role": "Verifier", "topology": 1, "service_uuid": "{SERVICE}"}}"#
        ))
        .unwrap();
        assert_eq!(config.topology, Topology::CentralClientMode);
    }

    #[test]
    fn unknown_topology_is_a_configuration_error() {
        let err = SessionConfig::from_json(&format!(
            r#"{{"role": "holder", "topology": "mesh", "service_uuid": "{SERVICE}"}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, Error::UnknownTopology(t) if t == "mesh"));

        let err = SessionConfig::from_json(&format!(
            r#"{{"role": "holder", "topology": 7, "service_uuid": "{SERVICE}"}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, Error::UnknownTopologyCode(7)));

        assert!(matches!(
            Topology::parse("nfc"),
            Err(Error::UnknownTopology(_))
        ));
    }

    #[test]
    fn unknown_role_is_a_configuration_error() {
        let err = SessionConfig::from_json(&format!(
            r#"{{"role": "issuer", "topology": 0, "service_uuid": "{SERVICE}"}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, Error::UnknownRole(r) if r == "issuer"));
    }

    #[test]
    fn chunk_size_and_markers_are_validated() {
        let mut config = SessionConfig::new(
            Role::Holder,
            Topology::CentralClientMode,
            Uuid::new_v4(),
        );
        config.chunk_size = 1;
        assert!(matches!(config.validate(), Err(Error::ChunkSizeTooSmall(1))));
        config.chunk_size = 2;
        config.chunk_markers.last = config.chunk_markers.pending;
        assert!(matches!(config.validate(), Err(Error::MarkersCollide)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
        assert_eq!(policy.backoff(3), Duration::from_millis(50));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }

    #[test]
    fn serializes_names() {
        let config = SessionConfig::new(Role::Verifier, Topology::PeripheralServerMode, Uuid::nil());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["role"], "verifier");
        assert_eq!(json["topology"], "peripheral_server_mode");
    }
}
