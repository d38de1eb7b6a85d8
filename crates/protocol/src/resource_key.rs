// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Device set that the legacy `"both"` token expands to.
pub const DEFAULT_DEVICE_PAIR: [u32; 2] = [0, 1];

/// Returned when a GPU identifier cannot be normalised into a [`ResourceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid resource key {input:?}: {reason}")]
pub struct InvalidResourceKey {
    pub input: String,
    pub reason: String,
}

impl InvalidResourceKey {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Normalised identifier for one GPU or a fixed set of GPUs bound together
/// as a single allocation unit.
///
/// The canonical textual form is the ascending, de-duplicated list of device
/// indices joined with commas and no whitespace: `"0"`, `"0,1"`. Every way of
/// obtaining a key goes through [`ResourceKey::parse`] or
/// [`ResourceKey::from_index`], so two keys naming the same device set always
/// compare equal, hash equal, and render identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    devices: Vec<u32>,
}

impl ResourceKey {
    /// Key for a single device.
    pub fn from_index(index: u32) -> Self {
        Self {
            devices: vec![index],
        }
    }

    /// Build a key from an arbitrary, non-empty set of device indices.
    pub fn from_devices<I: IntoIterator<Item = u32>>(devices: I) -> Result<Self, InvalidResourceKey> {
        let mut devices: Vec<u32> = devices.into_iter().collect();
        if devices.is_empty() {
            return Err(InvalidResourceKey::new("", "no devices given"));
        }
        devices.sort_unstable();
        devices.dedup();
        Ok(Self { devices })
    }

    /// Parse and normalise a textual GPU identifier.
    ///
    /// Accepts a single index (`"1"`), a comma-joined list in any order with
    /// optional whitespace around the tokens (`"1, 0"`), and the legacy token
    /// `"both"` which maps to [`DEFAULT_DEVICE_PAIR`].
    pub fn parse(input: &str) -> Result<Self, InvalidResourceKey> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(InvalidResourceKey::new(input, "empty identifier"));
        }

        if trimmed.eq_ignore_ascii_case("both") {
            return Ok(Self {
                devices: DEFAULT_DEVICE_PAIR.to_vec(),
            });
        }

        let mut devices = Vec::new();
        for token in trimmed.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(InvalidResourceKey::new(input, "empty device token"));
            }
            if !token.bytes().all(|b| b.is_ascii_digit()) {
                return Err(InvalidResourceKey::new(
                    input,
                    format!("device token {token:?} is not a non-negative integer"),
                ));
            }
            let index = token.parse::<u32>().map_err(|e| {
                InvalidResourceKey::new(input, format!("device token {token:?}: {e}"))
            })?;
            devices.push(index);
        }

        Self::from_devices(devices).map_err(|e| InvalidResourceKey::new(input, e.reason))
    }

    /// Lowest device index; used to derive default ports.
    pub fn lowest(&self) -> u32 {
        // `devices` is never empty by construction.
        self.devices.first().copied().unwrap_or_default()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.devices.binary_search(&index).is_ok()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, device) in self.devices.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{device}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourceKey {
    type Err = InvalidResourceKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<u32> for ResourceKey {
    fn from(index: u32) -> Self {
        Self::from_index(index)
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = ResourceKeyInput::deserialize(deserializer)?;
        input.normalize().map_err(serde::de::Error::custom)
    }
}

/// Loosely-typed GPU identifier as it arrives from callers: either a bare
/// integer or a string in any of the forms [`ResourceKey::parse`] accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceKeyInput {
    Index(i64),
    Text(String),
}

impl ResourceKeyInput {
    pub fn normalize(&self) -> Result<ResourceKey, InvalidResourceKey> {
        match self {
            ResourceKeyInput::Index(i) => u32::try_from(*i)
                .map(ResourceKey::from_index)
                .map_err(|_| {
                    InvalidResourceKey::new(&i.to_string(), "device index out of range")
                }),
            ResourceKeyInput::Text(s) => ResourceKey::parse(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_index_forms_agree() {
        let from_int = ResourceKeyInput::Index(1).normalize().unwrap();
        let from_str = ResourceKey::parse("1").unwrap();
        assert_eq!(from_int, from_str);
        assert_eq!(from_str.to_string(), "1");
    }

    #[test]
    fn composite_is_sorted_and_deduplicated() {
        let key = ResourceKey::parse(" 1, 0 ,1").unwrap();
        assert_eq!(key.to_string(), "0,1");
        assert!(key.contains(0));
        assert!(key.contains(1));
        assert!(!key.contains(2));
    }

    #[test]
    fn legacy_both_maps_to_default_pair() {
        assert_eq!(ResourceKey::parse("both").unwrap().to_string(), "0,1");
        assert_eq!(ResourceKey::parse("BOTH").unwrap(), ResourceKey::parse("1,0").unwrap());
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        for bad in ["", "  ", "0,", ",1", "gpu0", "-1", "1.5", "0;1", "a,b"] {
            assert!(ResourceKey::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(ResourceKeyInput::Index(-1).normalize().is_err());
    }

    #[test]
    fn serde_uses_canonical_string() {
        let key = ResourceKey::parse("1,0").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"0,1\"");

        let back: ResourceKey = serde_json::from_str("\"both\"").unwrap();
        assert_eq!(back, key);

        let from_int: ResourceKey = serde_json::from_str("3").unwrap();
        assert_eq!(from_int.to_string(), "3");
    }

    proptest! {
        #[test]
        fn normalisation_is_idempotent(devices in proptest::collection::vec(0u32..64, 1..6)) {
            let raw = devices.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(" , ");
            let once = ResourceKey::parse(&raw).unwrap();
            let twice = ResourceKey::parse(&once.to_string()).unwrap();
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(once.to_string(), twice.to_string());

            let mut expected = devices.clone();
            expected.sort_unstable();
            expected.dedup();
            let expected = expected.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",");
            prop_assert_eq!(once.to_string(), expected);
        }

        #[test]
        fn canonical_form_has_no_whitespace(devices in proptest::collection::vec(0u32..1000, 1..8)) {
            let key = ResourceKey::from_devices(devices).unwrap();
            let rendered = key.to_string();
            prop_assert!(!rendered.contains(' '));
            prop_assert_eq!(ResourceKey::parse(&rendered).unwrap(), key);
        }
    }
}
