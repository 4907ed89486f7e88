// SPDX-License-Identifier: Apache-2.0

//! Redaction of secrets carried by the configuration.
//!
//! Connection URIs embed credentials. They are wrapped in [`Sensitive`] so
//! that `Debug`, `Display` and serialization never print them; the raw value
//! is only reachable through [`Sensitive::expose`] when a driver needs it.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

const REDACTED: &str = "[REDACTED]";
const MASKED_PASSWORD: &str = "***";

/// Secret value that formats as `[REDACTED]`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Raw value, for handing to a driver. Never log the result.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Sensitive<String> {
    /// The URI with its password masked, safe for logs.
    pub fn redacted(&self) -> String {
        redact_uri(&self.0)
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> Serialize for Sensitive<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(MASKED_PASSWORD)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sensitive<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Sensitive)
    }
}

/// Masks the password of a connection URI.
///
/// Input that does not parse as a URL is fully redacted.
pub fn redact_uri(uri: &str) -> String {
    let Ok(mut url) = Url::parse(uri) else {
        return REDACTED.to_string();
    };
    if url.password().is_some() && url.set_password(Some(MASKED_PASSWORD)).is_err() {
        return REDACTED.to_string();
    }
    url.to_string()
}
