//! Installed-application registry backed by the local account database.
//!
//! On Linux every account owning a uid stands in for an installed
//! application. Declarations from the config file are merged on top and win
//! over passwd entries with the same identifier.

use crate::config::Config;
use crate::error::Result;
use crate::store::AppRegistry;
use crate::types::{InstalledApp, Uid};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

const PASSWD_PATH: &str = "/etc/passwd";
const NOBODY_UID: Uid = 65534;

pub struct PasswdRegistry {
    passwd_path: PathBuf,
    min_user_uid: Uid,
    declared: Vec<InstalledApp>,
}

impl PasswdRegistry {
    pub fn new(min_user_uid: Uid, declared: Vec<InstalledApp>) -> Self {
        Self {
            passwd_path: PathBuf::from(PASSWD_PATH),
            min_user_uid,
            declared,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.min_user_uid,
            config.apps.iter().map(InstalledApp::from).collect(),
        )
    }

    pub fn with_passwd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.passwd_path = path.into();
        self
    }
}

impl AppRegistry for PasswdRegistry {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        let content = std::fs::read_to_string(&self.passwd_path)?;
        let mut apps: BTreeMap<String, InstalledApp> = parse_passwd(&content, self.min_user_uid)
            .into_iter()
            .map(|app| (app.identifier.clone(), app))
            .collect();

        for app in &self.declared {
            apps.insert(app.identifier.clone(), app.clone());
        }

        debug!("Registry enumerated {} applications", apps.len());
        Ok(apps.into_values().collect())
    }
}

/// Parse `name:pw:uid:gid:gecos:home:shell` lines, skipping malformed ones
pub fn parse_passwd(content: &str, min_user_uid: Uid) -> Vec<InstalledApp> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 5 || fields[0].is_empty() {
                return None;
            }
            let uid: Uid = fields[2].parse().ok()?;
            let gecos = fields[4].split(',').next().unwrap_or("").trim();
            let display_name = if gecos.is_empty() { fields[0] } else { gecos };

            Some(InstalledApp {
                identifier: fields[0].to_string(),
                display_name: display_name.to_string(),
                uid,
                is_system: uid < min_user_uid || uid == NOBODY_UID,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
root:x:0:0:root:/root:/bin/bash
# comment
systemd-network:x:998:998:systemd Network Management,,,:/:/usr/sbin/nologin
alice:x:1000:1000:Alice Example,,,:/home/alice:/bin/bash
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
broken:x:notanumber:0::/:/bin/false
";

    #[test]
    fn test_parse_passwd() {
        let apps = parse_passwd(SAMPLE, 1000);
        assert_eq!(apps.len(), 4);

        let alice = apps.iter().find(|a| a.identifier == "alice").unwrap();
        assert_eq!(alice.display_name, "Alice Example");
        assert_eq!(alice.uid, 1000);
        assert!(!alice.is_system);

        let network = apps.iter().find(|a| a.identifier == "systemd-network").unwrap();
        assert_eq!(network.display_name, "systemd Network Management");
        assert!(network.is_system);

        assert!(apps.iter().find(|a| a.identifier == "nobody").unwrap().is_system);
    }

    #[test]
    fn test_declared_apps_override_passwd() {
        let path = std::env::temp_dir().join(format!("netwarden-passwd-{}", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();

        let declared = vec![
            InstalledApp {
                identifier: "alice".into(),
                display_name: "Alice's Browser".into(),
                uid: 1000,
                is_system: false,
            },
            InstalledApp {
                identifier: "svc.sync".into(),
                display_name: "Sync".into(),
                uid: 2001,
                is_system: false,
            },
        ];
        let registry = PasswdRegistry::new(1000, declared).with_passwd_path(&path);
        let apps = registry.installed_apps().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(apps.len(), 5);
        let alice = apps.iter().find(|a| a.identifier == "alice").unwrap();
        assert_eq!(alice.display_name, "Alice's Browser");
        assert!(apps.iter().any(|a| a.identifier == "svc.sync"));
    }
}
