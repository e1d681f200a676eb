//! Vendors (distribution families) and the suites they publish.
//!
//! A suite may be derived from another: `experimental` overlays `sid`,
//! `bookworm-backports` overlays `bookworm`. Builds for a derived suite run
//! in the base suite's snapshot with the derived suite added as an extra
//! repository, so a snapshot only ever exists for the root of a hierarchy.

use crate::config::VendorSection;

const DEBIAN_KEYRING: &str = "/usr/share/keyrings/debian-archive-keyring.gpg";
const UBUNTU_KEYRING: &str = "/usr/share/keyrings/ubuntu-archive-keyring.gpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vendor {
    pub name: String,
    pub default_suite: Option<String>,
    pub components: Vec<String>,
    /// Keyring debootstrap verifies the archive with.
    pub apt_key: String,
    pub archive: String,
    /// Alternative suite names, e.g. `unstable` for `sid`.
    pub aliases: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    pub name: String,
    pub vendor: String,
    /// Archive the suite is published in; `${archive}` in mirror strings.
    pub archive: String,
    /// Name as it appears in `sources.list`.
    pub apt_suite: String,
    pub components: Vec<String>,
    pub apt_key: String,
    pub sbuild_resolver: Vec<String>,
    pub base: Option<Box<Suite>>,
}

impl Vendor {
    /// Built-in knowledge for well-known vendors; anything else gets a
    /// generic definition named after itself.
    pub fn builtin(name: &str) -> Self {
        match name {
            "debian" => Self {
                name: name.to_owned(),
                default_suite: Some("sid".to_owned()),
                components: vec!["main".to_owned()],
                apt_key: DEBIAN_KEYRING.to_owned(),
                archive: "debian".to_owned(),
                aliases: vec![
                    ("unstable".to_owned(), "sid".to_owned()),
                    ("rc-buggy".to_owned(), "experimental".to_owned()),
                ],
            },
            "ubuntu" => Self {
                name: name.to_owned(),
                default_suite: None,
                components: vec!["main".to_owned(), "universe".to_owned()],
                apt_key: UBUNTU_KEYRING.to_owned(),
                archive: "ubuntu".to_owned(),
                aliases: Vec::new(),
            },
            other => Self {
                name: other.to_owned(),
                default_suite: None,
                components: vec!["main".to_owned()],
                apt_key: format!("/usr/share/keyrings/{other}-archive-keyring.gpg"),
                archive: other.to_owned(),
                aliases: Vec::new(),
            },
        }
    }

    /// Apply a `[vendors.<name>]` section from the config file.
    #[must_use]
    pub fn with_overrides(mut self, section: &VendorSection) -> Self {
        if let Some(s) = &section.default_suite {
            self.default_suite = Some(s.clone());
        }
        if let Some(c) = &section.components {
            self.components.clone_from(c);
        }
        if let Some(k) = &section.apt_key {
            self.apt_key.clone_from(k);
        }
        if let Some(a) = &section.archive {
            self.archive.clone_from(a);
        }
        for (alias, target) in &section.aliases {
            self.aliases.retain(|(a, _)| a != alias);
            self.aliases.push((alias.clone(), target.clone()));
        }
        self
    }

    /// Follow aliases to the canonical suite name.
    pub fn canonical_suite_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases
            .iter()
            .find(|(alias, _)| alias == name)
            .map_or(name, |(_, target)| target.as_str())
    }

    /// Resolve a suite name (or alias) into a `Suite` with its hierarchy.
    pub fn suite(&self, name: &str) -> Suite {
        let name = self.canonical_suite_name(name);

        if self.name == "debian" && name == "experimental" {
            let mut suite = self.plain_suite(name, None);
            suite.base = Some(Box::new(self.suite("sid")));
            suite.sbuild_resolver = vec!["--build-dep-resolver=aspcud".to_owned()];
            return suite;
        }

        if let Some(base) = name.strip_suffix("-apt.buildd.debian.org") {
            let mut suite = self.plain_suite(name, Some("apt.buildd.debian.org"));
            suite.apt_suite = base.to_owned();
            suite.base = Some(Box::new(self.suite(base)));
            return suite;
        }

        if let Some(base) = name.strip_suffix("-security") {
            let mut suite = if self.name == "debian" {
                let mut s = self.plain_suite(name, Some("security.debian.org"));
                s.apt_suite = format!("{base}/updates");
                s
            } else {
                self.plain_suite(name, None)
            };
            suite.base = Some(Box::new(self.suite(base)));
            return suite;
        }

        if let Some(base) = name.strip_suffix("-backports") {
            let mut suite = self.plain_suite(name, None);
            suite.base = Some(Box::new(self.suite(base)));
            suite.sbuild_resolver = vec!["--build-dep-resolver=aptitude".to_owned()];
            return suite;
        }

        for pocket in ["-updates", "-proposed"] {
            if let Some(base) = name.strip_suffix(pocket) {
                let mut suite = self.plain_suite(name, None);
                suite.base = Some(Box::new(self.suite(base)));
                return suite;
            }
        }

        self.plain_suite(name, None)
    }

    fn plain_suite(&self, name: &str, archive: Option<&str>) -> Suite {
        Suite {
            name: name.to_owned(),
            vendor: self.name.clone(),
            archive: archive.unwrap_or(&self.archive).to_owned(),
            apt_suite: name.to_owned(),
            components: self.components.clone(),
            apt_key: self.apt_key.clone(),
            sbuild_resolver: Vec::new(),
            base: None,
        }
    }
}

impl Suite {
    /// This suite followed by its bases, most derived first.
    pub fn hierarchy(&self) -> Vec<&Suite> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(base) = current.base.as_deref() {
            chain.push(base);
            current = base;
        }
        chain
    }

    /// The suite whose snapshot builds of this suite run in.
    pub fn root(&self) -> &Suite {
        let mut current = self;
        while let Some(base) = current.base.as_deref() {
            current = base;
        }
        current
    }
}

impl std::fmt::Display for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn debian_defaults() {
        let debian = Vendor::builtin("debian");
        assert_eq!(debian.default_suite.as_deref(), Some("sid"));
        assert_eq!(debian.components, ["main"]);
        assert_eq!(debian.apt_key, DEBIAN_KEYRING);
        assert_eq!(debian.suite("experimental").root().apt_key, DEBIAN_KEYRING);
    }

    #[test]
    fn unstable_is_sid() {
        let debian = Vendor::builtin("debian");
        let sid = debian.suite("unstable");
        assert_eq!(sid.name, "sid");
        assert_eq!(sid.apt_suite, "sid");
        assert_eq!(sid.archive, "debian");
        assert!(sid.base.is_none());
        assert_eq!(sid.hierarchy().len(), 1);
    }

    #[test]
    fn experimental_builds_on_sid_with_aspcud() {
        let debian = Vendor::builtin("debian");
        let experimental = debian.suite("rc-buggy");
        assert_eq!(experimental.name, "experimental");
        let names: Vec<&str> = experimental.hierarchy().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["experimental", "sid"]);
        assert_eq!(experimental.root().name, "sid");
        assert_eq!(experimental.sbuild_resolver[0], "--build-dep-resolver=aspcud");
    }

    #[test]
    fn backports_use_aptitude_resolver() {
        let debian = Vendor::builtin("debian");
        let bp = debian.suite("bookworm-backports");
        assert_eq!(bp.root().name, "bookworm");
        assert_eq!(bp.sbuild_resolver, ["--build-dep-resolver=aptitude"]);
        assert_eq!(bp.archive, "debian");
    }

    #[test]
    fn debian_security_has_own_archive() {
        let debian = Vendor::builtin("debian");
        let sec = debian.suite("wheezy-security");
        assert_eq!(sec.archive, "security.debian.org");
        assert_eq!(sec.apt_suite, "wheezy/updates");
        let names: Vec<&str> = sec.hierarchy().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["wheezy-security", "wheezy"]);
    }

    #[test]
    fn buildd_suite() {
        let debian = Vendor::builtin("debian");
        let buildd = debian.suite("jessie-apt.buildd.debian.org");
        assert_eq!(buildd.archive, "apt.buildd.debian.org");
        assert_eq!(buildd.apt_suite, "jessie");
        assert_eq!(buildd.root().name, "jessie");
    }

    #[test]
    fn ubuntu_components_and_pockets() {
        let ubuntu = Vendor::builtin("ubuntu");
        assert_eq!(ubuntu.components, ["main", "universe"]);
        assert_eq!(ubuntu.suite("noble").apt_key, UBUNTU_KEYRING);
        assert_eq!(ubuntu.canonical_suite_name("unstable"), "unstable");
        let updates = ubuntu.suite("noble-updates");
        assert_eq!(updates.root().name, "noble");
        assert_eq!(updates.archive, "ubuntu");
        let sec = ubuntu.suite("noble-security");
        assert_eq!(sec.archive, "ubuntu");
        assert_eq!(sec.apt_suite, "noble-security");
    }

    #[test]
    fn unknown_vendor_is_generic() {
        let steamos = Vendor::builtin("steamos");
        assert_eq!(steamos.archive, "steamos");
        assert!(steamos.default_suite.is_none());
        assert_eq!(steamos.suite("brewmaster").archive, "steamos");
    }

    #[test]
    fn overrides_replace_fields_and_aliases() {
        let mut aliases = BTreeMap::new();
        aliases.insert("unstable".to_owned(), "trixie".to_owned());
        aliases.insert("stable".to_owned(), "bookworm".to_owned());
        let section = VendorSection {
            default_suite: Some("trixie".to_owned()),
            components: Some(vec!["main".to_owned(), "contrib".to_owned()]),
            apt_key: Some("/etc/kiln/mirror-keyring.gpg".to_owned()),
            aliases,
            ..VendorSection::default()
        };
        let debian = Vendor::builtin("debian").with_overrides(&section);
        assert_eq!(debian.default_suite.as_deref(), Some("trixie"));
        assert_eq!(debian.components, ["main", "contrib"]);
        assert_eq!(debian.suite("sid").apt_key, "/etc/kiln/mirror-keyring.gpg");
        assert_eq!(debian.canonical_suite_name("unstable"), "trixie");
        assert_eq!(debian.canonical_suite_name("stable"), "bookworm");
        assert_eq!(debian.canonical_suite_name("rc-buggy"), "experimental");
    }
}
