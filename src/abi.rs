//! ABI identity helpers.
//!
//! Every module runs once per target ABI. A module instance is identified by
//! the composite id `"{abi} {name}"`, which is what the repository, the result
//! tree and the XML report all key on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// ABIs the compatibility suite knows how to target.
pub const SUPPORTED_ABIS: &[(&str, &str)] = &[
    ("armeabi-v7a", "32"),
    ("arm64-v8a", "64"),
    ("x86", "32"),
    ("x86_64", "64"),
    ("mips", "32"),
    ("mips64", "64"),
];

/// A target ABI: its name and bitness.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Abi {
    name: String,
    bitness: String,
}

impl Abi {
    pub fn new(name: impl Into<String>, bitness: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bitness: bitness.into(),
        }
    }

    /// Looks up a supported ABI by name, filling in its bitness.
    pub fn from_name(name: &str) -> Option<Self> {
        SUPPORTED_ABIS
            .iter()
            .find(|(abi, _)| *abi == name)
            .map(|(abi, bits)| Self::new(*abi, *bits))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bitness(&self) -> &str {
        &self.bitness
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Returns true if `name` is one of [`SUPPORTED_ABIS`].
pub fn is_supported(name: &str) -> bool {
    SUPPORTED_ABIS.iter().any(|(abi, _)| *abi == name)
}

/// Builds the composite id for a module instance.
pub fn create_id(abi: &str, name: &str) -> String {
    format!("{} {}", abi, name)
}

/// Splits a composite id into `(abi, name)`.
///
/// Ids without a space have no ABI part; the whole id is the name.
pub fn parse_id(id: &str) -> (Option<&str>, &str) {
    match id.split_once(' ') {
        Some((abi, name)) => (Some(abi), name),
        None => (None, id),
    }
}
