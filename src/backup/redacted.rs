//! Secret strings that never leak through `Debug` or serialization.
//!
//! Database passwords and encryption passphrases are held in `RedactedString`,
//! which prints and serializes as a placeholder and wipes its buffer on drop.

use bon::Builder;
use derive_more::From;
use getset::Getters;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::result;
use validator::{ValidateLength, ValidationError};
use zeroize::Zeroize;

/// Placeholder text shown instead of the secret in logs/debug output
pub static REDACTED_SECRET: &str = "###REDACTED###";

/// Shortest passphrase accepted for artifact encryption
pub const MIN_PASSPHRASE_LEN: u64 = 8;

#[derive(Clone, Zeroize, From, Builder, PartialEq, Eq, Getters, Default)]
#[getset(get = "pub")]
pub struct RedactedString {
    #[builder(into)]
    inner: String,
}

impl RedactedString {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self {
            inner: value.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<&str> for RedactedString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl ValidateLength<u64> for RedactedString {
    fn length(&self) -> Option<u64> {
        u64::try_from(self.inner.chars().count()).ok()
    }
}

pub fn validate_passphrase(passphrase: &RedactedString) -> Result<(), ValidationError> {
    if passphrase.validate_length(Some(MIN_PASSPHRASE_LEN), None, None) {
        Ok(())
    } else {
        Err(ValidationError::new("WeakPassphrase").with_message(
            format!("passphrase must be at least {MIN_PASSPHRASE_LEN} characters").into(),
        ))
    }
}

impl Debug for RedactedString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", REDACTED_SECRET)
    }
}

impl Serialize for RedactedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED_SECRET)
    }
}

impl<'de> Deserialize<'de> for RedactedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(RedactedStringVisitor)
    }
}

impl Drop for RedactedString {
    fn drop(&mut self) {
        self.zeroize();
    }
}

pub struct RedactedStringVisitor;

impl Visitor<'_> for RedactedStringVisitor {
    type Value = RedactedString;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a string")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(RedactedString::builder().inner(v).build())
    }
}
