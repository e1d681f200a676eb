use std::fmt;
use std::process::Command;

/// A host tool a backend needs, with a hint on where to get it.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

pub(crate) fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Tools the qemu worker needs on the host. Empty means all present.
pub fn check_qemu_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists(crate::qemu::VIRT_SERVER) {
        missing.push(MissingPrereq {
            name: crate::qemu::VIRT_SERVER,
            purpose: "booting and driving the build worker",
            install_hint: "apt install autopkgtest",
        });
    }

    let has_qemu = ["qemu-system-x86_64", "qemu-system-aarch64", "kvm"]
        .iter()
        .any(|bin| command_exists(bin));
    if !has_qemu {
        missing.push(MissingPrereq {
            name: "qemu",
            purpose: "virtual machine emulation",
            install_hint: "apt install qemu-system",
        });
    }

    missing
}

pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nkiln needs these tools to boot qemu workers.");
    msg
}
