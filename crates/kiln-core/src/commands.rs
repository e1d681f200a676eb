//! Argument vectors for the commands the stages run inside a worker.

use kiln_schema::Suite;

/// Name of the schroot the build stage registers its snapshot under.
pub const SCHROOT_NAME: &str = "kiln";
pub const SCHROOT_CONFIG_PATH: &str = "/etc/schroot/chroot.d/kiln";

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_owned()).collect()
}

pub fn worker_env() -> Vec<(String, String)> {
    vec![
        ("DEBIAN_FRONTEND".to_owned(), "noninteractive".to_owned()),
        ("LC_ALL".to_owned(), "C.UTF-8".to_owned()),
    ]
}

pub fn apt_update() -> Vec<String> {
    argv(&["apt-get", "-y", "update"])
}

pub fn apt_install(packages: &[&str]) -> Vec<String> {
    let mut cmd = argv(&["apt-get", "-y", "--no-install-recommends", "install"]);
    cmd.extend(packages.iter().map(|p| (*p).to_owned()));
    cmd
}

/// `install -d`, optionally owned by `owner` (user and group).
pub fn make_dir(path: &str, owner: Option<&str>) -> Vec<String> {
    let mut cmd = argv(&["install", "-d", "-m755"]);
    if let Some(owner) = owner {
        cmd.push(format!("-o{owner}"));
        cmd.push(format!("-g{owner}"));
    }
    cmd.push(path.to_owned());
    cmd
}

pub fn debootstrap(
    suite: &Suite,
    architecture: &str,
    target: &str,
    mirror: &str,
) -> Vec<String> {
    vec![
        "debootstrap".to_owned(),
        format!("--arch={architecture}"),
        format!("--components={}", suite.components.join(",")),
        format!("--keyring={}", suite.apt_key),
        "--variant=buildd".to_owned(),
        "--include=fakeroot,sudo".to_owned(),
        suite.apt_suite.clone(),
        target.to_owned(),
        mirror.to_owned(),
    ]
}

pub fn pack_tarball(chroot: &str, output: &str) -> Vec<String> {
    argv(&["tar", "-C", chroot, "-czf", output, "."])
}

/// schroot definition for a file-type chroot backed by `tarball`.
pub fn schroot_config(tarball: &str) -> String {
    format!(
        "[{SCHROOT_NAME}]\n\
         type=file\n\
         description=kiln build snapshot\n\
         file={tarball}\n\
         groups=root,sbuild\n\
         root-groups=root,sbuild\n\
         profile=sbuild\n"
    )
}

pub fn install_schroot_config(staged: &str) -> Vec<String> {
    argv(&["install", "-m644", staged, SCHROOT_CONFIG_PATH])
}

/// `deb` line adding a derived suite on top of its base snapshot.
pub fn extra_repository(mirror: &str, suite: &Suite) -> String {
    format!(
        "deb {mirror} {} {}",
        suite.apt_suite,
        suite.components.join(" ")
    )
}

#[derive(Debug, Clone)]
pub struct SbuildInvocation<'a> {
    pub suite: &'a Suite,
    pub architecture: &'a str,
    /// `(mirror, suite)` for every suite above the snapshot's root.
    pub overlays: Vec<(String, &'a Suite)>,
    pub parallel: Option<u32>,
    pub package: &'a str,
    pub out_dir: &'a str,
}

impl SbuildInvocation<'_> {
    pub fn argv(&self) -> Vec<String> {
        let mut cmd = vec![
            "env".to_owned(),
            format!("--chdir={}", self.out_dir),
            "runuser".to_owned(),
            "-u".to_owned(),
            "sbuild".to_owned(),
            "--".to_owned(),
            "sbuild".to_owned(),
            "-c".to_owned(),
            SCHROOT_NAME.to_owned(),
            "-d".to_owned(),
            self.suite.name.clone(),
            "--no-run-lintian".to_owned(),
        ];

        for (mirror, suite) in &self.overlays {
            cmd.push("--extra-repository".to_owned());
            cmd.push(extra_repository(mirror, suite));
            cmd.extend(suite.sbuild_resolver.iter().cloned());
        }

        // dpkg-buildpackage in jessie and older rejects -J.
        let old_dpkg = ["jessie", "wheezy"]
            .iter()
            .any(|old| self.suite.name.starts_with(old));
        match self.parallel {
            None | Some(1) => {}
            Some(_) if old_dpkg => {}
            Some(0) => cmd.push("--debbuildopt=-Jauto".to_owned()),
            Some(n) => cmd.push(format!("--debbuildopt=-J{n}")),
        }

        cmd.push(format!("--arch={}", self.architecture));
        cmd.push(self.package.to_owned());
        cmd
    }
}
