//! Installed-application sync, rule editing and listing.

use crate::error::{NetwardenError, Result};
use crate::rule_cache::RuleCache;
use crate::store::{AppRegistry, RuleStore};
use crate::types::{ApplicationRule, InstalledApp, Uid};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub installed: usize,
    pub created: usize,
    pub updated: usize,
    pub pruned: usize,
}

/// Reconcile the rule table with the registry.
///
/// Block flags of known applications are kept; new applications get an
/// unblocked row. Only new or renamed rows are written. With `prune`, rows of
/// applications that are gone from the registry are deleted.
pub fn sync_installed_apps(
    rules: &dyn RuleStore,
    registry: &dyn AppRegistry,
    self_identifier: &str,
    prune: bool,
) -> Result<SyncReport> {
    let installed: Vec<InstalledApp> = registry
        .installed_apps()?
        .into_iter()
        .filter(|app| app.identifier != self_identifier)
        .collect();
    let existing: HashMap<String, ApplicationRule> = rules
        .all_rules()?
        .into_iter()
        .map(|rule| (rule.identifier.clone(), rule))
        .collect();

    let mut report = SyncReport {
        installed: installed.len(),
        ..Default::default()
    };
    let mut changed = Vec::new();
    let mut seen = HashSet::new();

    for app in &installed {
        if !seen.insert(app.identifier.as_str()) {
            continue;
        }
        match existing.get(&app.identifier) {
            Some(rule) if rule.display_name == app.display_name && rule.is_system == app.is_system => {}
            Some(rule) => {
                let mut refreshed = rule.clone();
                refreshed.display_name = app.display_name.clone();
                refreshed.is_system = app.is_system;
                refreshed.last_updated = Utc::now();
                changed.push(refreshed);
                report.updated += 1;
            }
            None => {
                changed.push(ApplicationRule::new(
                    app.identifier.clone(),
                    app.display_name.clone(),
                    app.is_system,
                ));
                report.created += 1;
            }
        }
    }

    if !changed.is_empty() {
        rules.upsert_rules(&changed)?;
    }

    if prune {
        let stale: Vec<String> = existing
            .keys()
            .filter(|identifier| !seen.contains(identifier.as_str()))
            .cloned()
            .collect();
        report.pruned = rules.delete_rules(&stale)?;
    }

    info!(
        "Synced {} applications ({} new, {} updated, {} pruned)",
        report.installed, report.created, report.updated, report.pruned
    );
    Ok(report)
}

/// Rule writes that keep the rule cache honest
pub struct RuleEditor {
    rules: Arc<dyn RuleStore>,
    cache: Option<Arc<RuleCache>>,
}

impl RuleEditor {
    pub fn new(rules: Arc<dyn RuleStore>) -> Self {
        Self { rules, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<RuleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn set_rule(&self, identifier: &str, wifi_blocked: bool, cellular_blocked: bool) -> Result<()> {
        self.rules.update_rule(identifier, wifi_blocked, cellular_blocked)?;
        if let Some(cache) = &self.cache {
            cache.invalidate_identifier(identifier);
        }
        Ok(())
    }

    pub fn toggle_wifi(&self, identifier: &str) -> Result<ApplicationRule> {
        let mut rule = self.require(identifier)?;
        rule.wifi_blocked = !rule.wifi_blocked;
        self.set_rule(identifier, rule.wifi_blocked, rule.cellular_blocked)?;
        Ok(rule)
    }

    pub fn toggle_cellular(&self, identifier: &str) -> Result<ApplicationRule> {
        let mut rule = self.require(identifier)?;
        rule.cellular_blocked = !rule.cellular_blocked;
        self.set_rule(identifier, rule.wifi_blocked, rule.cellular_blocked)?;
        Ok(rule)
    }

    pub fn set_all_wifi(&self, blocked: bool) -> Result<usize> {
        let count = self.rules.set_all_wifi_blocked(blocked)?;
        self.invalidate_all();
        Ok(count)
    }

    pub fn set_all_cellular(&self, blocked: bool) -> Result<usize> {
        let count = self.rules.set_all_cellular_blocked(blocked)?;
        self.invalidate_all();
        Ok(count)
    }

    fn require(&self, identifier: &str) -> Result<ApplicationRule> {
        self.rules
            .rule(identifier)?
            .ok_or_else(|| NetwardenError::AppNotFound(identifier.to_string()))
    }

    fn invalidate_all(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Name,
    BlockedFirst,
    SystemLast,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "name" => Ok(SortOrder::Name),
            "blocked-first" | "blocked" => Ok(SortOrder::BlockedFirst),
            "system-last" | "system" => Ok(SortOrder::SystemLast),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

/// An application row as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppEntry {
    pub identifier: String,
    pub display_name: String,
    pub uid: Option<Uid>,
    pub is_system: bool,
    pub wifi_blocked: bool,
    pub cellular_blocked: bool,
    pub installed: bool,
}

impl AppEntry {
    pub fn is_blocked_anywhere(&self) -> bool {
        self.wifi_blocked || self.cellular_blocked
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppListing {
    search: Option<String>,
    hide_system: bool,
    sort: SortOrder,
}

impl AppListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        let query = query.into().to_lowercase();
        self.search = if query.is_empty() { None } else { Some(query) };
        self
    }

    pub fn hide_system(mut self, hide: bool) -> Self {
        self.hide_system = hide;
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Join registry entries with rules, then filter and sort
    pub fn apply(&self, installed: &[InstalledApp], rules: &[ApplicationRule]) -> Vec<AppEntry> {
        let uids: HashMap<&str, &InstalledApp> =
            installed.iter().map(|app| (app.identifier.as_str(), app)).collect();

        let mut entries: Vec<AppEntry> = rules
            .iter()
            .map(|rule| AppEntry {
                identifier: rule.identifier.clone(),
                display_name: rule.display_name.clone(),
                uid: uids.get(rule.identifier.as_str()).map(|app| app.uid),
                is_system: rule.is_system,
                wifi_blocked: rule.wifi_blocked,
                cellular_blocked: rule.cellular_blocked,
                installed: uids.contains_key(rule.identifier.as_str()),
            })
            .collect();

        let known: HashSet<&str> = rules.iter().map(|rule| rule.identifier.as_str()).collect();
        entries.extend(
            installed
                .iter()
                .filter(|app| !known.contains(app.identifier.as_str()))
                .map(|app| AppEntry {
                    identifier: app.identifier.clone(),
                    display_name: app.display_name.clone(),
                    uid: Some(app.uid),
                    is_system: app.is_system,
                    wifi_blocked: false,
                    cellular_blocked: false,
                    installed: true,
                }),
        );

        entries.retain(|entry| self.matches(entry));

        entries.sort_by_key(|entry| entry.display_name.to_lowercase());
        match self.sort {
            SortOrder::Name => {}
            SortOrder::BlockedFirst => entries.sort_by_key(|entry| !entry.is_blocked_anywhere()),
            SortOrder::SystemLast => entries.sort_by_key(|entry| entry.is_system),
        }
        entries
    }

    fn matches(&self, entry: &AppEntry) -> bool {
        if self.hide_system && entry.is_system {
            return false;
        }
        match &self.search {
            Some(query) => {
                entry.display_name.to_lowercase().contains(query)
                    || entry.identifier.to_lowercase().contains(query)
            }
            None => true,
        }
    }
}
