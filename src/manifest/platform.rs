//! OS and architecture pairs accepted in manifest lists

use crate::error::{Result, StackError};

const VALID_OS_ARCHES: &[(&str, &[&str])] = &[
    ("darwin", &["386", "amd64", "arm", "arm64"]),
    ("dragonfly", &["amd64"]),
    ("freebsd", &["386", "amd64", "arm"]),
    (
        "linux",
        &[
            "386", "amd64", "arm", "arm64", "ppc64le", "mips64", "mips64le", "riscv64", "s390x",
        ],
    ),
    ("netbsd", &["386", "amd64", "arm"]),
    ("openbsd", &["386", "amd64", "arm"]),
    ("plan9", &["386", "amd64"]),
    ("solaris", &["amd64"]),
    ("windows", &["386", "amd64"]),
];

pub fn is_valid_os_arch(os: &str, arch: &str) -> bool {
    VALID_OS_ARCHES
        .iter()
        .any(|(o, arches)| *o == os && arches.contains(&arch))
}

pub fn validate_os_arch(os: &str, arch: &str) -> Result<()> {
    if is_valid_os_arch(os, arch) {
        return Ok(());
    }
    Err(StackError::Validation(format!(
        "manifest entry for image has unsupported os/arch combination: {}/{}",
        os, arch
    )))
}
