//! Platform classification.
//!
//! Every platform-specific branch in this workspace matches on
//! [`PlatformClass`]. The raw image family string is only inspected here.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformClass {
    Posix,
    Windows,
}

impl PlatformClass {
    /// Classify an image family such as `debian-11` or `windows-2019`.
    ///
    /// Total over all inputs: anything not recognisably Windows is POSIX.
    pub fn classify(identifier: &str) -> Self {
        let lowered = identifier.trim().to_ascii_lowercase();
        let is_windows = lowered
            .split(|c: char| c == '-' || c == '_' || c == '/')
            .any(|segment| segment == "windows" || segment == "win");
        if is_windows {
            PlatformClass::Windows
        } else {
            PlatformClass::Posix
        }
    }

    pub fn is_windows(self) -> bool {
        matches!(self, PlatformClass::Windows)
    }

    /// Where the agent reads its configuration from.
    pub fn agent_config_path(self) -> &'static str {
        match self {
            PlatformClass::Posix => "/etc/google-cloud-ops-agent/config.yaml",
            PlatformClass::Windows => {
                r"C:\Program Files\Google\Cloud Operations\Ops Agent\config\config.yaml"
            }
        }
    }
}

impl fmt::Display for PlatformClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformClass::Posix => write!(f, "posix"),
            PlatformClass::Windows => write!(f, "windows"),
        }
    }
}

/// Public image project hosting an image family, derived from its prefix.
///
/// Returns `None` when the family is not one of the well-known public images;
/// callers must then be told the project explicitly.
pub fn image_project_for(identifier: &str) -> Option<&'static str> {
    const PREFIXES: &[(&str, &str)] = &[
        ("debian", "debian-cloud"),
        ("ubuntu", "ubuntu-os-cloud"),
        ("rocky-linux", "rocky-linux-cloud"),
        ("rocky", "rocky-linux-cloud"),
        ("rhel", "rhel-cloud"),
        ("centos", "centos-cloud"),
        ("sles", "suse-cloud"),
        ("opensuse", "opensuse-cloud"),
        ("windows", "windows-cloud"),
        ("sql-", "windows-sql-cloud"),
    ];

    let lowered = identifier.trim().to_ascii_lowercase();
    PREFIXES
        .iter()
        .find(|(prefix, _)| lowered.starts_with(prefix))
        .map(|(_, project)| *project)
}
