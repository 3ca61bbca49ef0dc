//! Local device information reported to upstream during enrollment.

use serde::{Deserialize, Serialize};
use std::env;

const UNKNOWN: &str = "unknown";

/// The host this node runs on, as sent with the device entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub os_name: String,
    pub os_version: String,
    pub machine_name: String,
    pub arch: String,
}

impl DeviceInfo {
    /// Reads the host's OS, version, name and architecture.
    ///
    /// Anything the host cannot report comes back as `"unknown"`.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os_name: env::consts::OS.to_string(),
            os_version: os_version(),
            machine_name: machine_name(),
            arch: env::consts::ARCH.to_string(),
        }
    }
}

/// A geographic position, when the host can provide one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTag {
    pub lat: f64,
    pub lng: f64,
}

fn machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[cfg(target_os = "linux")]
fn os_version() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|release| parse_os_release_version(&release))
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[cfg(target_os = "macos")]
fn os_version() -> String {
    std::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn os_version() -> String {
    UNKNOWN.to_string()
}

/// `VERSION_ID` from an os-release file, unquoted.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_os_release_version(release: &str) -> Option<String> {
    release.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "VERSION_ID").then(|| value.trim().trim_matches('"').to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::parse_os_release_version;

    #[test]
    fn reads_version_id() {
        let release = "NAME=\"Debian GNU/Linux\"\nVERSION_ID=\"12\"\nID=debian\n";
        assert_eq!(parse_os_release_version(release).as_deref(), Some("12"));
        assert_eq!(parse_os_release_version("ID=alpine\n"), None);
    }
}
