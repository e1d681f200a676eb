//! What the build stage builds: a package sbuild fetches from the archive,
//! or a local source package copied into the worker first.

use crate::CoreError;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// `name` or `name_version`, downloaded by sbuild.
    Archive(String),
    /// A `.dsc` and the files it lists, all in one host directory.
    Local { dsc: PathBuf, files: Vec<PathBuf> },
}

impl PackageSource {
    /// Anything containing `/` or ending in `.dsc` or `.changes` is a local
    /// path; everything else is an archive name. A `.changes` file stands
    /// for the one `.dsc` it lists.
    pub fn resolve(package: &str) -> Result<Self, CoreError> {
        if package.is_empty() || package.starts_with('-') || package.contains(char::is_whitespace) {
            return Err(CoreError::InvalidSource(format!(
                "'{package}' must be a non-empty word not starting with '-'"
            )));
        }
        let is_path = package.contains('/')
            || package.ends_with(".dsc")
            || package.ends_with(".changes");
        if !is_path {
            return Ok(Self::Archive(package.to_owned()));
        }

        let path = Path::new(package);
        if path.is_dir() {
            return Err(CoreError::InvalidSource(format!(
                "{package} is a directory; build a .dsc or .changes file instead"
            )));
        }
        if !path.is_file() {
            return Err(CoreError::InvalidSource(format!("{package}: no such file")));
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("dsc") => local_dsc(path),
            Some("changes") => {
                let listed = listed_files(path)?;
                let mut dscs = listed.iter().filter(|f| f.extension().is_some_and(|e| e == "dsc"));
                match (dscs.next(), dscs.next()) {
                    (Some(dsc), None) => local_dsc(dsc),
                    _ => Err(CoreError::InvalidSource(format!(
                        "{package} must list exactly one .dsc"
                    ))),
                }
            }
            _ => Err(CoreError::InvalidSource(format!(
                "{package} is not a .dsc or .changes file"
            ))),
        }
    }
}

fn local_dsc(dsc: &Path) -> Result<PackageSource, CoreError> {
    let files = listed_files(dsc)?;
    if files.is_empty() {
        return Err(CoreError::InvalidSource(format!(
            "{} lists no files",
            dsc.display()
        )));
    }
    for file in &files {
        if !file.is_file() {
            return Err(CoreError::InvalidSource(format!(
                "{} lists {}, which does not exist",
                dsc.display(),
                file.display()
            )));
        }
    }
    Ok(PackageSource::Local {
        dsc: dsc.to_path_buf(),
        files,
    })
}

/// Paths named in the `Files` field of a `.dsc` or `.changes`, resolved
/// against the directory the control file is in.
fn listed_files(control: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let text = std::fs::read_to_string(control)
        .map_err(|e| CoreError::InvalidSource(format!("{}: {e}", control.display())))?;
    let dir = control.parent().unwrap_or_else(|| Path::new("."));

    let mut files = Vec::new();
    for name in files_field(&text) {
        if name.contains('/') || name == ".." || name == "." {
            return Err(CoreError::InvalidSource(format!(
                "{} lists an invalid file name '{name}'",
                control.display()
            )));
        }
        files.push(dir.join(name));
    }
    Ok(files)
}

/// Last word of each continuation line of `Files:`. Both control file
/// kinds put the file name last.
fn files_field(text: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut in_files = false;
    for line in text.lines() {
        if line.starts_with([' ', '\t']) {
            if in_files {
                names.extend(line.split_whitespace().last());
            }
            continue;
        }
        in_files = line
            .split_once(':')
            .is_some_and(|(field, _)| field.trim().eq_ignore_ascii_case("files"));
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailureCause;
    use std::fs;

    const DSC: &str = "\
-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA512

Format: 3.0 (quilt)
Source: hello
Version: 2.10-3
Checksums-Sha256:
 2a2d cafe 725946 hello_2.10.orig.tar.gz
Files:
 6cd0ffea3884a4e79330338dcc2987d6 725946 hello_2.10.orig.tar.gz
 e3b0c44298fc1c149afbf4c8996fb924 12688 hello_2.10-3.debian.tar.xz

-----BEGIN PGP SIGNATURE-----

iQIzBAEBCgAdFiEE
-----END PGP SIGNATURE-----
";

    fn write_source(dir: &Path) -> PathBuf {
        let dsc = dir.join("hello_2.10-3.dsc");
        fs::write(&dsc, DSC).unwrap();
        fs::write(dir.join("hello_2.10.orig.tar.gz"), b"orig").unwrap();
        fs::write(dir.join("hello_2.10-3.debian.tar.xz"), b"debian").unwrap();
        dsc
    }

    fn cause(package: &str) -> FailureCause {
        FailureCause::of(&PackageSource::resolve(package).unwrap_err())
    }

    #[test]
    fn names_are_fetched_from_the_archive() {
        assert_eq!(
            PackageSource::resolve("hello_2.10-3").unwrap(),
            PackageSource::Archive("hello_2.10-3".to_owned())
        );
        assert_eq!(
            PackageSource::resolve("hello").unwrap(),
            PackageSource::Archive("hello".to_owned())
        );
    }

    #[test]
    fn option_like_names_are_rejected() {
        for bad in ["", "--evil", "two words"] {
            assert_eq!(cause(bad), FailureCause::InvalidSource, "{bad:?}");
        }
    }

    #[test]
    fn files_field_only_reads_files() {
        assert_eq!(
            files_field(DSC),
            ["hello_2.10.orig.tar.gz", "hello_2.10-3.debian.tar.xz"]
        );
    }

    #[test]
    fn dsc_lists_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let dsc = write_source(dir.path());

        let source = PackageSource::resolve(&dsc.to_string_lossy()).unwrap();
        assert_eq!(
            source,
            PackageSource::Local {
                dsc: dsc.clone(),
                files: vec![
                    dir.path().join("hello_2.10.orig.tar.gz"),
                    dir.path().join("hello_2.10-3.debian.tar.xz"),
                ],
            }
        );
    }

    #[test]
    fn changes_leads_to_its_dsc() {
        let dir = tempfile::tempdir().unwrap();
        let dsc = write_source(dir.path());
        let changes = dir.path().join("hello_2.10-3_source.changes");
        fs::write(
            &changes,
            "Source: hello\nFiles:\n 0a1b 1234 devel optional hello_2.10-3.dsc\n 0c2d 725946 devel optional hello_2.10.orig.tar.gz\n",
        )
        .unwrap();

        match PackageSource::resolve(&changes.to_string_lossy()).unwrap() {
            PackageSource::Local { dsc: found, files } => {
                assert_eq!(found, dsc);
                assert_eq!(files.len(), 2);
            }
            other => panic!("expected a local source, got {other:?}"),
        }
    }

    #[test]
    fn missing_listed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dsc = write_source(dir.path());
        fs::remove_file(dir.path().join("hello_2.10.orig.tar.gz")).unwrap();
        assert_eq!(cause(&dsc.to_string_lossy()), FailureCause::InvalidSource);
    }

    #[test]
    fn unusable_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("notes.txt");
        fs::write(&other, b"x").unwrap();
        let escaping = dir.path().join("evil.dsc");
        fs::write(&escaping, "Files:\n 00 1 ../../etc/shadow\n").unwrap();

        for path in [
            dir.path().to_path_buf(),
            other,
            escaping,
            dir.path().join("absent.dsc"),
        ] {
            assert_eq!(
                cause(&path.to_string_lossy()),
                FailureCause::InvalidSource,
                "{}",
                path.display()
            );
        }
    }
}
