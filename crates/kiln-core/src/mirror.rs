use crate::CoreError;
use kiln_schema::KilnConfig;
use std::collections::BTreeMap;

/// Sources a mirror URL can come from, in precedence order.
///
/// The environment default is the `KILN_MIRROR` variable, else the config
/// file's `[mirrors]` entry for the archive, else its `default` entry.
/// `${archive}` in whichever URL wins is replaced by the archive name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorConfig {
    pub explicit: Option<String>,
    pub variable: Option<String>,
    pub table: BTreeMap<String, String>,
}

impl MirrorConfig {
    pub fn new(explicit: Option<String>, variable: Option<String>, config: &KilnConfig) -> Self {
        Self {
            explicit: explicit.filter(|m| !m.is_empty()),
            variable: variable.filter(|m| !m.is_empty()),
            table: config.mirrors.clone(),
        }
    }

    /// Explicit value, else environment default, else `NoMirrorConfigured`.
    pub fn resolve(explicit: Option<&str>, environment_default: Option<&str>) -> Option<String> {
        explicit.or(environment_default).map(str::to_owned)
    }

    pub fn environment_default(&self, archive: &str) -> Option<String> {
        self.variable.clone().or_else(|| {
            self.table
                .get(archive)
                .or_else(|| self.table.get("default"))
                .cloned()
        })
    }

    pub fn resolve_for(&self, archive: &str) -> Result<String, CoreError> {
        let env_default = self.environment_default(archive);
        Self::resolve(self.explicit.as_deref(), env_default.as_deref())
            .map(|url| url.replace("${archive}", archive))
            .ok_or_else(|| CoreError::NoMirrorConfigured(archive.to_owned()))
    }
}
