//! UID-keyed rule cache serving the packet hot path.
//!
//! Decisions are answered from memory only. A miss answers "not blocked" and
//! queues a load on a background task, which resolves the uid through the
//! registered package mapping and fetches the rule from the store.

use crate::error::Result;
use crate::store::RuleStore;
use crate::types::{ApplicationRule, TransportState, Uid};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 150;

/// Cached blocking rule for one uid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRule {
    pub uid: Uid,
    pub identifier: String,
    pub display_name: String,
    pub wifi_blocked: bool,
    pub cellular_blocked: bool,
}

impl CachedRule {
    fn from_rule(uid: Uid, rule: &ApplicationRule) -> Self {
        Self {
            uid,
            identifier: rule.identifier.clone(),
            display_name: rule.display_name.clone(),
            wifi_blocked: rule.wifi_blocked,
            cellular_blocked: rule.cellular_blocked,
        }
    }

    /// Entry for an application the store has no rule for
    fn unblocked(uid: Uid, identifier: String) -> Self {
        Self {
            uid,
            display_name: identifier.clone(),
            identifier,
            wifi_blocked: false,
            cellular_blocked: false,
        }
    }

    pub fn blocks_on(&self, transport: TransportState) -> bool {
        match transport {
            TransportState::Wifi => self.wifi_blocked,
            TransportState::Cellular => self.cellular_blocked,
            TransportState::None => false,
        }
    }
}

struct LoadRequest {
    uid: Uid,
    identifier: String,
    generation: u64,
}

struct CacheInner {
    rules: Mutex<LruCache<Uid, CachedRule>>,
    packages: Mutex<LruCache<Uid, String>>,
    pending: Mutex<HashSet<Uid>>,
    /// Bumped by every invalidation; loads started under an older value are dropped
    generation: AtomicU64,
}

impl CacheInner {
    fn finish_load(&self, request: LoadRequest, entry: Option<CachedRule>) {
        {
            let mut rules = self.rules.lock();
            if let Some(entry) = entry {
                if self.generation.load(Ordering::Acquire) == request.generation {
                    rules.put(request.uid, entry);
                } else {
                    debug!("Discarding stale rule load for uid {}", request.uid);
                }
            }
        }
        self.pending.lock().remove(&request.uid);
    }
}

pub struct RuleCache {
    inner: Arc<CacheInner>,
    store: Arc<dyn RuleStore>,
    loader: mpsc::UnboundedSender<LoadRequest>,
}

impl RuleCache {
    /// Create the cache and spawn its loader task on the current runtime
    pub fn new(store: Arc<dyn RuleStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(CacheInner {
            rules: Mutex::new(LruCache::new(capacity)),
            packages: Mutex::new(LruCache::new(capacity)),
            pending: Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loader(inner.clone(), store.clone(), rx));

        Self {
            inner,
            store,
            loader: tx,
        }
    }

    /// Whether traffic from `uid` is blocked on `transport`.
    ///
    /// Never blocks. Unknown uids are allowed and a background load is queued.
    pub fn decide_for_uid(&self, uid: Uid, transport: TransportState) -> bool {
        if let Some(entry) = self.inner.rules.lock().get(&uid) {
            return entry.blocks_on(transport);
        }
        self.schedule_load(uid);
        false
    }

    fn schedule_load(&self, uid: Uid) {
        let identifier = match self.inner.packages.lock().peek(&uid) {
            Some(identifier) => identifier.clone(),
            None => return,
        };

        if !self.inner.pending.lock().insert(uid) {
            return;
        }

        let request = LoadRequest {
            uid,
            identifier,
            generation: self.inner.generation.load(Ordering::Acquire),
        };
        if self.loader.send(request).is_err() {
            self.inner.pending.lock().remove(&uid);
        }
    }

    pub fn register_uid_package(&self, uid: Uid, identifier: impl Into<String>) {
        self.inner.packages.lock().put(uid, identifier.into());
    }

    pub fn identifier_for(&self, uid: Uid) -> Option<String> {
        self.inner.packages.lock().peek(&uid).cloned()
    }

    /// Cached entry without touching recency
    pub fn cached(&self, uid: Uid) -> Option<CachedRule> {
        self.inner.rules.lock().peek(&uid).cloned()
    }

    /// Identifier and display name for log records
    pub fn describe(&self, uid: Uid) -> Option<(String, String)> {
        if let Some(entry) = self.inner.rules.lock().peek(&uid) {
            return Some((entry.identifier.clone(), entry.display_name.clone()));
        }
        self.identifier_for(uid).map(|id| (id.clone(), id))
    }

    /// Register every mapping and warm entries for the given blocked rules.
    /// Returns the number of cache entries populated.
    pub fn preload_with(&self, packages: &HashMap<Uid, String>, blocked: &[ApplicationRule]) -> usize {
        let by_identifier: HashMap<&str, &ApplicationRule> =
            blocked.iter().map(|r| (r.identifier.as_str(), r)).collect();

        let mut populated = 0;
        let mut package_map = self.inner.packages.lock();
        let mut rules = self.inner.rules.lock();
        for (uid, identifier) in packages {
            package_map.put(*uid, identifier.clone());
            if let Some(rule) = by_identifier.get(identifier.as_str()) {
                rules.put(*uid, CachedRule::from_rule(*uid, rule));
                populated += 1;
            }
        }
        debug!("Preloaded {} rule cache entries", populated);
        populated
    }

    /// Fetch the blocked rules from the store and warm the cache
    pub async fn preload(&self, packages: &HashMap<Uid, String>) -> Result<usize> {
        let store = self.store.clone();
        let blocked = tokio::task::spawn_blocking(move || store.blocked_rules()).await??;
        Ok(self.preload_with(packages, &blocked))
    }

    /// Drop the entry for `uid`; the next decision triggers a fresh load
    pub fn invalidate(&self, uid: Uid) {
        let mut rules = self.inner.rules.lock();
        rules.pop(&uid);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Invalidate every uid registered for `identifier`
    pub fn invalidate_identifier(&self, identifier: &str) {
        let uids: Vec<Uid> = self
            .inner
            .packages
            .lock()
            .iter()
            .filter(|(_, id)| id.as_str() == identifier)
            .map(|(uid, _)| *uid)
            .collect();
        for uid in uids {
            self.invalidate(uid);
        }
    }

    /// Drop every cached rule, keeping the package mapping
    pub fn invalidate_all(&self) {
        let mut rules = self.inner.rules.lock();
        rules.clear();
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop rules and package mappings
    pub fn clear(&self) {
        self.invalidate_all();
        self.inner.packages.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.rules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rules.lock().is_empty()
    }

    pub fn is_loading(&self) -> bool {
        !self.inner.pending.lock().is_empty()
    }
}

async fn run_loader(
    inner: Arc<CacheInner>,
    store: Arc<dyn RuleStore>,
    mut rx: mpsc::UnboundedReceiver<LoadRequest>,
) {
    while let Some(request) = rx.recv().await {
        let lookup_store = store.clone();
        let identifier = request.identifier.clone();
        let result = tokio::task::spawn_blocking(move || lookup_store.rule(&identifier)).await;

        let entry = match result {
            Ok(Ok(Some(rule))) => Some(CachedRule::from_rule(request.uid, &rule)),
            Ok(Ok(None)) => Some(CachedRule::unblocked(request.uid, request.identifier.clone())),
            Ok(Err(e)) => {
                warn!("Rule load for uid {} failed: {}", request.uid, e);
                None
            }
            Err(e) => {
                warn!("Rule load task for uid {} failed: {}", request.uid, e);
                None
            }
        };
        inner.finish_load(request, entry);
    }
    debug!("Rule cache loader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use std::time::Duration;

    fn store_with(rules: &[(&str, bool, bool)]) -> Arc<Database> {
        let db = Database::in_memory().unwrap();
        for (identifier, wifi, cellular) in rules {
            let mut rule = ApplicationRule::new(*identifier, *identifier, false);
            rule.wifi_blocked = *wifi;
            rule.cellular_blocked = *cellular;
            db.upsert_rule(&rule).unwrap();
        }
        Arc::new(db)
    }

    async fn settle(cache: &RuleCache) {
        for _ in 0..200 {
            if !cache.is_loading() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("rule load did not finish");
    }

    #[tokio::test]
    async fn test_preload_then_decide() {
        let store = store_with(&[("com.app.a", true, false)]);
        let cache = RuleCache::new(store, DEFAULT_CAPACITY);

        let packages = HashMap::from([(1000, "com.app.a".to_string())]);
        assert_eq!(cache.preload(&packages).await.unwrap(), 1);

        assert!(cache.decide_for_uid(1000, TransportState::Wifi));
        assert!(!cache.decide_for_uid(1000, TransportState::Cellular));
        assert!(!cache.decide_for_uid(1000, TransportState::None));
    }

    #[tokio::test]
    async fn test_unregistered_uid_is_never_blocked() {
        let store = store_with(&[("com.app.a", true, true)]);
        let cache = RuleCache::new(store, DEFAULT_CAPACITY);

        for transport in [TransportState::Wifi, TransportState::Cellular, TransportState::None] {
            assert!(!cache.decide_for_uid(4242, transport));
        }
        assert!(!cache.is_loading());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_miss_fails_open_then_loads() {
        let store = store_with(&[("com.app.a", false, true)]);
        let cache = RuleCache::new(store, DEFAULT_CAPACITY);
        cache.register_uid_package(1000, "com.app.a");

        assert!(!cache.decide_for_uid(1000, TransportState::Cellular));
        settle(&cache).await;

        assert!(cache.decide_for_uid(1000, TransportState::Cellular));
        assert_eq!(cache.describe(1000), Some(("com.app.a".into(), "com.app.a".into())));
    }

    #[tokio::test]
    async fn test_missing_rule_caches_unblocked_entry() {
        let store = store_with(&[]);
        let cache = RuleCache::new(store, DEFAULT_CAPACITY);
        cache.register_uid_package(1001, "com.app.new");

        assert!(!cache.decide_for_uid(1001, TransportState::Wifi));
        settle(&cache).await;

        let entry = cache.cached(1001).unwrap();
        assert!(!entry.wifi_blocked && !entry.cellular_blocked);
    }

    #[tokio::test]
    async fn test_invalidate_forces_fresh_load() {
        let store = store_with(&[("com.app.a", true, false)]);
        let cache = RuleCache::new(store.clone(), DEFAULT_CAPACITY);
        let packages = HashMap::from([(1000, "com.app.a".to_string())]);
        cache.preload(&packages).await.unwrap();
        assert!(cache.decide_for_uid(1000, TransportState::Wifi));

        store.update_rule("com.app.a", false, false).unwrap();
        cache.invalidate(1000);

        assert!(!cache.decide_for_uid(1000, TransportState::Wifi));
        settle(&cache).await;
        assert!(!cache.decide_for_uid(1000, TransportState::Wifi));
        assert!(!cache.cached(1000).unwrap().wifi_blocked);
    }

    #[tokio::test]
    async fn test_stale_load_is_discarded() {
        let store = store_with(&[("com.app.a", true, false)]);
        let cache = RuleCache::new(store, DEFAULT_CAPACITY);
        cache.register_uid_package(1000, "com.app.a");

        let request = LoadRequest {
            uid: 1000,
            identifier: "com.app.a".into(),
            generation: cache.inner.generation.load(Ordering::Acquire),
        };
        cache.invalidate(1000);
        let entry = CachedRule::unblocked(1000, "com.app.a".into());
        cache.inner.finish_load(request, Some(entry));

        assert!(cache.cached(1000).is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let store = store_with(&[]);
        let cache = RuleCache::new(store, 2);
        let blocked: Vec<ApplicationRule> = ["a", "b", "c"]
            .iter()
            .map(|id| {
                let mut rule = ApplicationRule::new(*id, *id, false);
                rule.wifi_blocked = true;
                rule
            })
            .collect();

        cache.preload_with(&HashMap::from([(1, "a".to_string()), (2, "b".to_string())]), &blocked);
        cache.decide_for_uid(1, TransportState::Wifi);
        cache.preload_with(&HashMap::from([(3, "c".to_string())]), &blocked);

        assert_eq!(cache.len(), 2);
        assert!(cache.cached(1).is_some());
        assert!(cache.cached(2).is_none());
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let store = store_with(&[("com.app.a", true, true)]);
        let cache = RuleCache::new(store, DEFAULT_CAPACITY);
        cache
            .preload(&HashMap::from([(1000, "com.app.a".to_string())]))
            .await
            .unwrap();

        cache.clear();

        assert!(cache.is_empty());
        assert!(cache.identifier_for(1000).is_none());
        assert!(!cache.decide_for_uid(1000, TransportState::Wifi));
    }
}
