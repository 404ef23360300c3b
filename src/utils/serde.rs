/*!
 * Serde utilities for durations.
 *
 * History events and workflow inputs carry durations. They are written as
 * integer milliseconds so recorded history stays readable and stable across
 * versions. Configuration and workflow inputs written by hand accept seconds
 * given as an integer, a float or a numeric string.
 */

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize a `Duration` as integer milliseconds.
///
/// # Usage with serde
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize, Deserialize)]
/// struct Timer {
///     #[serde(with = "storage_workflows::utils::serde::duration_millis")]
///     fire_after: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Same as [`duration_millis`] for optional durations
pub mod option_duration_millis {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
                serializer.serialize_some(&millis)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// Serialize a `Duration` as seconds and accept flexible numeric input.
///
/// ```yaml
/// # All of these parse:
/// interval: 300        # integer seconds
/// interval: "300"      # numeric string
/// interval: 0.5        # fractional seconds
/// ```
pub mod duration_secs {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let seconds = match &value {
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| D::Error::custom(format!("Invalid numeric value: {n}")))?,
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| D::Error::custom(format!("Cannot parse '{s}' as seconds")))?,
            other => {
                return Err(D::Error::custom(format!(
                    "Expected seconds, found: {other:?}"
                )))
            }
        };
        Duration::try_from_secs_f64(seconds)
            .map_err(|e| D::Error::custom(format!("Invalid duration {seconds}: {e}")))
    }
}
