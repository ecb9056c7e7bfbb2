//! Live capture permission diagnostics.
//!
//! [`permission`] reports whether this process can capture live traffic and,
//! when it cannot, what to change. File replay never consults it.

use std::fmt;

/// Linux capability bit for `CAP_NET_ADMIN`.
const CAP_NET_ADMIN: u32 = 12;
/// Linux capability bit for `CAP_NET_RAW`.
const CAP_NET_RAW: u32 = 13;

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub granted: bool,
    pub platform: &'static str,
    /// What was checked, and the remedy when not granted.
    pub detail: String,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.granted { "granted" } else { "denied" };
        write!(f, "live capture {verdict} on {}: {}", self.platform, self.detail)
    }
}

/// Check live capture rights for the current process.
pub fn permission() -> Permission {
    check()
}

#[cfg(target_os = "linux")]
fn check() -> Permission {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(e) => {
            return Permission {
                granted: false,
                platform: "linux",
                detail: format!("cannot read /proc/self/status: {e}"),
            }
        }
    };
    linux_permission(&status)
}

#[cfg(target_os = "macos")]
fn check() -> Permission {
    let granted = std::fs::OpenOptions::new()
        .read(true)
        .open("/dev/bpf0")
        .is_ok();
    Permission {
        granted,
        platform: "macos",
        detail: if granted {
            "/dev/bpf0 is readable".to_string()
        } else {
            "no read access to /dev/bpf*; install ChmodBPF or run as root".to_string()
        },
    }
}

#[cfg(target_os = "windows")]
fn check() -> Permission {
    let root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".to_string());
    let granted = ["System32\\Npcap\\wpcap.dll", "System32\\wpcap.dll"]
        .iter()
        .any(|dll| std::path::Path::new(&root).join(dll).exists());
    Permission {
        granted,
        platform: "windows",
        detail: if granted {
            "wpcap.dll found".to_string()
        } else {
            "wpcap.dll not found; install Npcap".to_string()
        },
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn check() -> Permission {
    Permission {
        granted: false,
        platform: std::env::consts::OS,
        detail: "live capture permissions cannot be checked on this platform".to_string(),
    }
}

/// Decide from the contents of `/proc/self/status`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn linux_permission(status: &str) -> Permission {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .map(str::trim)
    };

    let root = field("Uid:")
        .and_then(|uids| uids.split_whitespace().nth(1))
        .is_some_and(|euid| euid == "0");
    let effective = field("CapEff:").and_then(|caps| u64::from_str_radix(caps, 16).ok());
    let raw = effective.is_some_and(|caps| caps & (1 << CAP_NET_RAW) != 0);
    let admin = effective.is_some_and(|caps| caps & (1 << CAP_NET_ADMIN) != 0);

    if root || (raw && admin) {
        return Permission {
            granted: true,
            platform: "linux",
            detail: if root {
                "running as root".to_string()
            } else {
                "CAP_NET_RAW and CAP_NET_ADMIN are effective".to_string()
            },
        };
    }

    let missing: Vec<&str> = [(raw, "CAP_NET_RAW"), (admin, "CAP_NET_ADMIN")]
        .into_iter()
        .filter(|(held, _)| !held)
        .map(|(_, name)| name)
        .collect();
    Permission {
        granted: false,
        platform: "linux",
        detail: format!(
            "missing {}; grant with `setcap cap_net_raw,cap_net_admin=eip $(which dumpcap)`",
            missing.join(" and ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "Name:\tlayerscope\nUid:\t1000\t1000\t1000\t1000\nCapEff:\t0000000000000000\n";

    #[test]
    fn test_linux_unprivileged() {
        let permission = linux_permission(USER);
        assert!(!permission.granted);
        assert!(permission.detail.contains("CAP_NET_RAW and CAP_NET_ADMIN"));
        assert!(permission.detail.contains("setcap"));
    }

    #[test]
    fn test_linux_capabilities() {
        let status = USER.replace("0000000000000000", "0000000000003000");
        let permission = linux_permission(&status);
        assert!(permission.granted);

        let status = USER.replace("0000000000000000", "0000000000002000");
        let permission = linux_permission(&status);
        assert!(!permission.granted);
        assert!(permission.detail.contains("missing CAP_NET_ADMIN"));
    }

    #[test]
    fn test_linux_root() {
        let status = "Uid:\t0\t0\t0\t0\nCapEff:\t0000000000000000\n";
        assert!(linux_permission(status).granted);
    }

    #[test]
    fn test_permission_display() {
        let permission = Permission {
            granted: false,
            platform: "linux",
            detail: "missing CAP_NET_RAW".to_string(),
        };
        assert_eq!(
            permission.to_string(),
            "live capture denied on linux: missing CAP_NET_RAW"
        );
    }
}
