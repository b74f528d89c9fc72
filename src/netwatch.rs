//! Link monitoring for the downlink-only override: collection is skipped
//! while a non-cellular interface is up (maintenance over Wi-Fi/Ethernet).

use std::fs;
use std::path::PathBuf;

pub trait LinkMonitor: Send + Sync {
    fn non_cellular_active(&self) -> bool;
}

/// Reads interface operstate from sysfs, the cheap equivalent of the
/// `ip addr show wlan0` check the provisioning scripts rely on.
pub struct SysClassNet {
    root: PathBuf,
    interfaces: Vec<String>,
}

impl SysClassNet {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            interfaces: vec!["wlan0".to_string(), "eth0".to_string()],
        }
    }
}

impl Default for SysClassNet {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMonitor for SysClassNet {
    fn non_cellular_active(&self) -> bool {
        self.interfaces.iter().any(|iface| {
            fs::read_to_string(self.root.join(iface).join("operstate"))
                .map(|s| s.trim() == "up")
                .unwrap_or(false)
        })
    }
}

/// Fixed answer, for tests and for devices without a maintenance link.
pub struct StaticLink(pub bool);

impl LinkMonitor for StaticLink {
    fn non_cellular_active(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_interface_is_detected() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("wlan0")).unwrap();
        fs::write(root.path().join("wlan0/operstate"), "up\n").unwrap();
        let monitor = SysClassNet::with_root(root.path());
        assert!(monitor.non_cellular_active());
    }

    #[test]
    fn down_or_missing_interfaces_are_inactive() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("wlan0")).unwrap();
        fs::write(root.path().join("wlan0/operstate"), "down\n").unwrap();
        let monitor = SysClassNet::with_root(root.path());
        assert!(!monitor.non_cellular_active());

        let empty = tempfile::tempdir().unwrap();
        assert!(!SysClassNet::with_root(empty.path()).non_cellular_active());
    }
}
