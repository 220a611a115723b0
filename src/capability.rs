//! Device capability snapshots.
//!
//! A [`CapabilitySnapshot`] is the feature set one device reported at one
//! moment. Snapshots are captured explicitly through a [`CapabilitySource`]
//! and never refreshed behind the caller's back; capture again to get a new
//! one.
//!
//! Feature listings use the package manager's format, one
//! `feature:<name>` token per line:
//!
//! ```text
//! feature:android.hardware.wifi
//! feature:android.software.backup
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::shell::{self, ShellCommand, ShellError};

/// Prefix of every token in a feature listing.
pub const FEATURE_PREFIX: &str = "feature:";

/// Errors raised while capturing device capabilities.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Failed to query features of {serial}: {source}")]
    Command {
        serial: String,
        #[source]
        source: ShellError,
    },

    #[error("Feature query for {serial} exited with {exit_code}: {stderr}")]
    CommandFailed {
        serial: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Malformed feature token '{0}'")]
    MalformedFeature(String),
}

/// Immutable feature set of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    serial: String,
    features: BTreeSet<String>,
    captured_at: DateTime<Utc>,
}

impl CapabilitySnapshot {
    pub fn new(serial: impl Into<String>, features: BTreeSet<String>) -> Self {
        Self {
            serial: serial.into(),
            features,
            captured_at: Utc::now(),
        }
    }

    /// Builds a snapshot from `feature:<name>` listing output.
    pub fn from_feature_listing(
        serial: impl Into<String>,
        output: &str,
    ) -> Result<Self, CapabilityError> {
        Ok(Self::new(serial, parse_feature_listing(output)?))
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// Parses whitespace-separated `feature:<name>` tokens.
pub fn parse_feature_listing(output: &str) -> Result<BTreeSet<String>, CapabilityError> {
    output
        .split_whitespace()
        .map(|token| match token.strip_prefix(FEATURE_PREFIX) {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(CapabilityError::MalformedFeature(token.to_string())),
        })
        .collect()
}

/// Something that can report a device's features.
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    async fn capture(&self, serial: &str) -> Result<CapabilitySnapshot, CapabilityError>;
}

/// Feature sets declared up front, per serial.
///
/// Serials without an entry report no features.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilitySource {
    features: BTreeMap<String, BTreeSet<String>>,
}

impl StaticCapabilitySource {
    pub fn new(features: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self { features }
    }

    pub fn with_device<I, S>(mut self, serial: impl Into<String>, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features
            .insert(serial.into(), features.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl CapabilitySource for StaticCapabilitySource {
    async fn capture(&self, serial: &str) -> Result<CapabilitySnapshot, CapabilityError> {
        let features = self.features.get(serial).cloned().unwrap_or_default();
        Ok(CapabilitySnapshot::new(serial, features))
    }
}

/// Runs a host command that prints the device's feature listing.
///
/// The command sees the device serial in `ANDROID_SERIAL`, e.g.
/// `adb -s "$ANDROID_SERIAL" shell pm list features`.
#[derive(Debug, Clone)]
pub struct CommandCapabilitySource {
    shell: String,
    command: String,
    timeout: Duration,
}

impl CommandCapabilitySource {
    pub fn new(shell: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CapabilitySource for CommandCapabilitySource {
    async fn capture(&self, serial: &str) -> Result<CapabilitySnapshot, CapabilityError> {
        let cmd = ShellCommand::new(&self.command)
            .env("ANDROID_SERIAL", serial)
            .timeout(self.timeout);
        let result = shell::run(&self.shell, &cmd)
            .await
            .map_err(|source| CapabilityError::Command {
                serial: serial.to_string(),
                source,
            })?;
        if !result.success() {
            return Err(CapabilityError::CommandFailed {
                serial: serial.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        let snapshot = CapabilitySnapshot::from_feature_listing(serial, &result.stdout)?;
        debug!("{} reports {} features", serial, snapshot.features().len());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feature_listing() -> Result<(), Box<dyn std::error::Error>> {
        let features = parse_feature_listing(
            "feature:android.hardware.wifi\nfeature:android.software.backup\r\n",
        )?;
        assert_eq!(features.len(), 2);
        assert!(features.contains("android.software.backup"));
        assert!(parse_feature_listing("")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        assert!(matches!(
            parse_feature_listing("feature:a garbage"),
            Err(CapabilityError::MalformedFeature(t)) if t == "garbage"
        ));
        assert!(parse_feature_listing("feature:").is_err());
    }

    #[tokio::test]
    async fn test_static_source() -> Result<(), Box<dyn std::error::Error>> {
        let source = StaticCapabilitySource::default().with_device("abc", ["android.hardware.nfc"]);
        let snapshot = source.capture("abc").await?;
        assert_eq!(snapshot.serial(), "abc");
        assert!(snapshot.has_feature("android.hardware.nfc"));
        assert!(source.capture("other").await?.features().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_command_source() -> Result<(), Box<dyn std::error::Error>> {
        let source = CommandCapabilitySource::new(
            "/bin/sh",
            "printf 'feature:%s.wifi\\n' \"$ANDROID_SERIAL\"",
            Duration::from_secs(10),
        );
        let snapshot = source.capture("dev1").await?;
        assert!(snapshot.has_feature("dev1.wifi"));
        Ok(())
    }

    #[tokio::test]
    async fn test_command_source_failure() {
        let source = CommandCapabilitySource::new("/bin/sh", "exit 2", Duration::from_secs(10));
        assert!(matches!(
            source.capture("dev1").await,
            Err(CapabilityError::CommandFailed { exit_code: 2, .. })
        ));
    }

    #[test]
    fn test_recapture_is_a_new_snapshot() {
        let first = CapabilitySnapshot::new("abc", BTreeSet::new());
        let second = CapabilitySnapshot::new("abc", BTreeSet::from(["x".to_string()]));
        assert!(!first.has_feature("x"));
        assert!(second.has_feature("x"));
        assert!(second.captured_at() >= first.captured_at());
    }
}
