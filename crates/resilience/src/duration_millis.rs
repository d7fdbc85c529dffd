//! Serde helpers encoding `Duration` as whole milliseconds
//!
//! ```rust
//! use std::time::Duration;
//!
//! use resilience_core::duration_millis;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Example {
//!     #[serde(with = "duration_millis")]
//!     timeout: Duration,
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde serialization result type
type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

fn to_millis(duration: &Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serialize a Duration as milliseconds (u64)
pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
where
    S: Serializer,
{
    serializer.serialize_u64(to_millis(duration))
}

/// Deserialize milliseconds (u64) into a Duration
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Same encoding for `Option<Duration>`, `None` as null
pub mod option {
    use super::{to_millis, Deserialize, Deserializer, Duration, SerializeResult, Serializer};

    /// Serialize an optional duration as milliseconds
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&to_millis(duration)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional duration from milliseconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
