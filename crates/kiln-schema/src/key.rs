use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one base environment: a (vendor, suite, architecture) triple.
///
/// The file stem `<vendor>-<suite>-<architecture>` is injective because
/// vendor and architecture may not contain `-`, so the first and last `-`
/// always delimit the suite, which may.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub vendor: String,
    pub suite: String,
    pub architecture: String,
}

impl SnapshotKey {
    pub fn new(
        vendor: impl Into<String>,
        suite: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Result<Self, SchemaError> {
        let key = Self {
            vendor: vendor.into(),
            suite: suite.into(),
            architecture: architecture.into(),
        };
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_component("vendor", &self.vendor, false)?;
        validate_component("suite", &self.suite, true)?;
        validate_component("architecture", &self.architecture, false)?;
        Ok(())
    }

    /// `<vendor>-<suite>-<architecture>`, without extension.
    pub fn file_stem(&self) -> String {
        format!("{}-{}-{}", self.vendor, self.suite, self.architecture)
    }

    /// Inverse of [`file_stem`](Self::file_stem).
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let (vendor, rest) = stem.split_once('-')?;
        let (suite, architecture) = rest.rsplit_once('-')?;
        Self::new(vendor, suite, architecture).ok()
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vendor, self.suite, self.architecture)
    }
}

/// Validate one name used in snapshot paths.
///
/// Allowed: `[A-Za-z0-9.+_~]`, plus `-` when `allow_dash` is set. Names may
/// not be empty, start with `.`, or exceed 128 bytes.
pub fn validate_component(
    field: &'static str,
    value: &str,
    allow_dash: bool,
) -> Result<(), SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidName {
        field,
        value: value.to_owned(),
        reason: reason.to_owned(),
    };

    if value.is_empty() || value.len() > 128 {
        return Err(invalid("must be 1-128 characters"));
    }
    if value.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    let ok = value.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'.' | b'+' | b'_' | b'~') || (allow_dash && b == b'-')
    });
    if !ok {
        return Err(invalid(if allow_dash {
            "must match [A-Za-z0-9.+_~-]"
        } else {
            "must match [A-Za-z0-9.+_~] (no '-')"
        }));
    }
    Ok(())
}
