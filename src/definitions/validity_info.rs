//! The validity window an issuer attaches to a mobile security object.
//!
//! Dates travel as `tdate` (tag 0 over an RFC 3339 string). Decoding enforces
//! `signed <= validFrom < validUntil`; a window that violates it is rejected,
//! never repaired.
use ciborium::Value;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ValidityInfo {
    pub signed: OffsetDateTime,
    pub valid_from: OffsetDateTime,
    pub valid_until: OffsetDateTime,
    pub expected_update: Option<OffsetDateTime>,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("When parsing a CBOR map, could not find required field: '{0}'")]
    MissingField(&'static str),
    #[error("Expected to parse a CBOR map, received: '{0:?}'")]
    NotAMap(Value),
    #[error("Expected to parse a CBOR text string, received: '{0:?}'")]
    NotATextString(Box<Value>),
    #[error("Expected to parse a CBOR tag (number {0}), received: '{1:?}'")]
    NotATag(u64, Value),
    #[error("Failed to parse date string as rfc3339 date: {0}")]
    UnableToParseDate(#[from] time::error::Parse),
    #[error("Failed to format date as rfc3339: {0}")]
    UnableToFormatDate(#[from] time::error::Format),
    #[error("validFrom ({valid_from}) precedes signed ({signed})")]
    ValidBeforeSigned {
        signed: OffsetDateTime,
        valid_from: OffsetDateTime,
    },
    #[error("validUntil ({valid_until}) is not after validFrom ({valid_from})")]
    EmptyWindow {
        valid_from: OffsetDateTime,
        valid_until: OffsetDateTime,
    },
}

impl ValidityInfo {
    /// Construct a window, checking the ordering invariant.
    pub fn new(
        signed: OffsetDateTime,
        valid_from: OffsetDateTime,
        valid_until: OffsetDateTime,
        expected_update: Option<OffsetDateTime>,
    ) -> Result<Self> {
        let validity = Self {
            signed,
            valid_from,
            valid_until,
            expected_update,
        };
        validity.validate()?;
        Ok(validity)
    }

    pub fn validate(&self) -> Result<()> {
        if self.valid_from < self.signed {
            return Err(Error::ValidBeforeSigned {
                signed: self.signed,
                valid_from: self.valid_from,
            });
        }
        if self.valid_until <= self.valid_from {
            return Err(Error::EmptyWindow {
                valid_from: self.valid_from,
                valid_until: self.valid_until,
            });
        }
        Ok(())
    }

    /// Whether `at` falls inside `[validFrom, validUntil)`.
    pub fn is_valid_at(&self, at: OffsetDateTime) -> bool {
        self.valid_from <= at && at < self.valid_until
    }
}

impl From<ValidityInfo> for Value {
    fn from(v: ValidityInfo) -> Value {
        let mut map = vec![
            (Value::Text(String::from("signed")), datetime_to_cbor(v.signed)),
            (
                Value::Text(String::from("validFrom")),
                datetime_to_cbor(v.valid_from),
            ),
            (
                Value::Text(String::from("validUntil")),
                datetime_to_cbor(v.valid_until),
            ),
        ];
        if let Some(expected_update) = v.expected_update {
            map.push((
                Value::Text(String::from("expectedUpdate")),
                datetime_to_cbor(expected_update),
            ));
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for ValidityInfo {
    type Error = Error;

    fn try_from(v: Value) -> Result<ValidityInfo> {
        let mut map = match v {
            Value::Map(map) => map,
            other => return Err(Error::NotAMap(other)),
        };
        let mut remove = |key: &'static str| {
            map.iter()
                .position(|(k, _)| matches!(k, Value::Text(t) if t == key))
                .map(|index| map.remove(index).1)
        };

        let signed = remove("signed")
            .ok_or(Error::MissingField("signed"))
            .and_then(cbor_to_datetime)?;
        let valid_from = remove("validFrom")
            .ok_or(Error::MissingField("validFrom"))
            .and_then(cbor_to_datetime)?;
        let valid_until = remove("validUntil")
            .ok_or(Error::MissingField("validUntil"))
            .and_then(cbor_to_datetime)?;
        let expected_update = remove("expectedUpdate")
            .map(cbor_to_datetime)
            .transpose()?;

        ValidityInfo::new(signed, valid_from, valid_until, expected_update)
    }
}

fn datetime_to_cbor(date: OffsetDateTime) -> Value {
    // Whole seconds in UTC, as tdate requires. Formatting a UTC timestamp
    // without subseconds cannot fail for years 0..=9999.
    let date = date
        .to_offset(UtcOffset::UTC)
        .replace_nanosecond(0)
        .unwrap_or(date);
    let text = date.format(&Rfc3339).unwrap_or_default();
    Value::Tag(0, Box::new(Value::Text(text)))
}

fn cbor_to_datetime(v: Value) -> Result<OffsetDateTime> {
    if let Value::Tag(0, inner) = v {
        if let Value::Text(date_str) = inner.as_ref() {
            Ok(OffsetDateTime::parse(date_str, &Rfc3339)?)
        } else {
            Err(Error::NotATextString(inner))
        }
    } else {
        Err(Error::NotATag(0, v))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;
    use time::macros::datetime;

    fn encode(signed: &str, valid_from: &str, valid_until: &str) -> Vec<u8> {
        let tdate = |s: &str| Value::Tag(0, Box::new(Value::Text(s.to_string())));
        cbor::to_vec(&Value::Map(vec![
            (Value::Text("signed".into()), tdate(signed)),
            (Value::Text("validFrom".into()), tdate(valid_from)),
            (Value::Text("validUntil".into()), tdate(valid_until)),
        ]))
        .unwrap()
    }

    #[test]
    fn roundtrip() {
        let validity = ValidityInfo::new(
            datetime!(2024-01-01 0:00 UTC),
            datetime!(2024-01-01 0:00 UTC),
            datetime!(2029-01-01 0:00 UTC),
            Some(datetime!(2025-01-01 0:00 UTC)),
        )
        .unwrap();
        let bytes = cbor::to_vec(&validity).unwrap();
        let decoded: ValidityInfo = cbor::from_slice(&bytes).unwrap();
        assert_eq!(validity, decoded);
    }

    #[test]
    fn rejects_until_before_from() {
        let bytes = encode(
            "2024-01-01T00:00:00Z",
            "2024-06-01T00:00:00Z",
            "2024-03-01T00:00:00Z",
        );
        assert!(cbor::from_slice::<ValidityInfo>(&bytes).is_err());
    }

    #[test]
    fn rejects_empty_window() {
        let bytes = encode(
            "2024-01-01T00:00:00Z",
            "2024-06-01T00:00:00Z",
            "2024-06-01T00:00:00Z",
        );
        assert!(cbor::from_slice::<ValidityInfo>(&bytes).is_err());
    }

    #[test]
    fn rejects_valid_from_before_signed() {
        let bytes = encode(
            "2024-02-01T00:00:00Z",
            "2024-01-01T00:00:00Z",
            "2025-01-01T00:00:00Z",
        );
        assert!(cbor::from_slice::<ValidityInfo>(&bytes).is_err());
    }

    #[test]
    fn validity_at() {
        let validity = ValidityInfo::new(
            datetime!(2024-01-01 0:00 UTC),
            datetime!(2024-01-02 0:00 UTC),
            datetime!(2024-02-01 0:00 UTC),
            None,
        )
        .unwrap();
        assert!(!validity.is_valid_at(datetime!(2024-01-01 12:00 UTC)));
        assert!(validity.is_valid_at(datetime!(2024-01-15 0:00 UTC)));
        assert!(!validity.is_valid_at(datetime!(2024-02-01 0:00 UTC)));
    }
}
