use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Backend kinds a worker descriptor may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// A qemu virtual machine driven through `autopkgtest-virt-qemu`.
    Qemu,
    /// In-process emulated worker, used by tests and dry runs.
    Mock,
}

impl WorkerKind {
    pub const ALL: &'static [WorkerKind] = &[WorkerKind::Qemu, WorkerKind::Mock];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Qemu => "qemu",
            WorkerKind::Mock => "mock",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = WorkerKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown worker kind '{s}' (known: {})", known.join(", "))
            })
    }
}

/// A parsed `--worker` argument: which backend to use and what it runs.
///
/// The locator is backend specific. For `qemu` it is the path of the disk
/// image the worker boots; for `mock` it is free-form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerDescriptor {
    pub kind: WorkerKind,
    pub locator: String,
}

impl WorkerDescriptor {
    /// Parse `<kind> <locator>`. Everything after the first run of whitespace
    /// following the kind is the locator, so locators may contain spaces.
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidDescriptor {
            input: input.to_owned(),
            reason,
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("descriptor is empty".to_owned()));
        }

        let (kind, locator) = match trimmed.split_once(char::is_whitespace) {
            Some((kind, rest)) => (kind, rest.trim_start()),
            None => (trimmed, ""),
        };
        let kind: WorkerKind = kind.parse().map_err(invalid)?;
        if locator.is_empty() {
            return Err(invalid(format!(
                "expected '<kind> <locator>', '{kind}' has no locator"
            )));
        }

        Ok(Self {
            kind,
            locator: locator.to_owned(),
        })
    }

    /// Check that the locator names something that exists.
    ///
    /// Parsing stays free of I/O; this is the separate configuration-time
    /// check run before any worker is acquired.
    pub fn validate(&self) -> Result<(), SchemaError> {
        match self.kind {
            WorkerKind::Qemu => {
                let image = Path::new(&self.locator);
                if image.is_file() {
                    Ok(())
                } else {
                    Err(SchemaError::InvalidDescriptor {
                        input: self.to_string(),
                        reason: format!("qemu image '{}' does not exist", image.display()),
                    })
                }
            }
            WorkerKind::Mock => Ok(()),
        }
    }
}

impl fmt::Display for WorkerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.locator)
    }
}

impl FromStr for WorkerDescriptor {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WorkerDescriptor {
    type Error = SchemaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<WorkerDescriptor> for String {
    fn from(d: WorkerDescriptor) -> Self {
        d.to_string()
    }
}
