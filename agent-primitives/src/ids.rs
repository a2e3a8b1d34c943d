//! Trace, span, and decision identifier types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::Error;

/// 128-bit identifier shared by every span of one workflow invocation.
///
/// Rendered as 32 lowercase hex characters, the W3C / OTLP wire form.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TraceId(u128);

impl TraceId {
    /// Generates a random, non-zero trace identifier.
    #[must_use]
    pub fn random() -> Self {
        loop {
            let value = Uuid::new_v4().as_u128();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Creates an identifier from its raw value.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// `from_str_radix` alone would also accept a leading `+`.
fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl FromStr for TraceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !is_hex(s) {
            return Err(Error::InvalidTraceId { value: s.to_owned() });
        }
        match u128::from_str_radix(s, 16) {
            Ok(0) | Err(_) => Err(Error::InvalidTraceId { value: s.to_owned() }),
            Ok(value) => Ok(Self(value)),
        }
    }
}

/// 64-bit identifier of a single span, unique within its trace.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SpanId(u64);

impl SpanId {
    /// Generates a random, non-zero span identifier.
    #[must_use]
    pub fn random() -> Self {
        loop {
            // Truncation keeps the low 64 random bits of the v4 UUID.
            #[allow(clippy::cast_possible_truncation)]
            let value = Uuid::new_v4().as_u128() as u64;
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Creates an identifier from its raw value.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SpanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !is_hex(s) {
            return Err(Error::InvalidSpanId { value: s.to_owned() });
        }
        match u64::from_str_radix(s, 16) {
            Ok(0) | Err(_) => Err(Error::InvalidSpanId { value: s.to_owned() }),
            Ok(value) => Ok(Self(value)),
        }
    }
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_serde!(TraceId);
hex_serde!(SpanId);

/// Unique identifier of a persisted policy decision.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionId(Uuid);

impl DecisionId {
    /// Generates a random decision identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::random()
    }
}

impl Display for DecisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for DecisionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for DecisionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(Error::from)?;
        Ok(Self(uuid))
    }
}
