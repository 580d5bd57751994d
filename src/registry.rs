//! Service registry cache
//!
//! The central cache mapping `(service name, client-affinity key)` to a
//! [`ServiceRecord`]. Three independent activities write to or read from
//! the same store:
//!
//! - request-handling tasks calling [`ServiceRegistry::get_or_fetch`]
//! - the one-second pull-refresh loop
//! - the UDP push listener (see [`crate::push`])
//!
//! All three rely only on atomic single-key operations of the underlying
//! [`Store`]; no reconciliation happens between a concurrent pull and push
//! for the same key; last write wins.
//!
//! Reads never block on network I/O once a record exists: a cache hit is
//! returned as-is and staleness is reconciled by the background loop,
//! trading staleness for read latency.
//!
//! The registry also keeps the known-services set (the membership test the
//! front end uses to decide whether a name is registry-managed) and
//! persists every successfully fetched response body to disk, keyed by
//! cache key, for warm restarts while the control plane is unreachable.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::error::{RecordError, RegistryResult};
use crate::fetch::{Fetch, PushPort};
use crate::push::PushListener;
use crate::record::{cache_key, parse_known_names, parse_record, split_cache_key, Instance, ServiceRecord};
use crate::selector::InstanceSelector;
use crate::server_pool::ServerPool;
use crate::store::Store;

/// Instance-query endpoint path on the control plane
pub const SERVICE_QUERY_PATH: &str = "/v1/ns/api/srvIPXT";

/// All-known-names endpoint path on the control plane
pub const ALL_NAMES_PATH: &str = "/v1/ns/api/allDomNames";

/// Minimum known-services refresh interval, regardless of server advice
const MIN_KNOWN_REFRESH_SECS: u64 = 30;

/// Cadence of the pull-refresh scan
const REFRESH_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// The set of service names the registry knows about
///
/// Used only as a membership test; refreshes swap the whole set under an
/// exclusive lock while membership tests take a shared lock, since tests
/// vastly outnumber refreshes.
pub struct KnownServices {
    names: RwLock<HashSet<String>>,
    refresh_secs: AtomicU64,
}

impl KnownServices {
    fn new() -> Self {
        Self {
            names: RwLock::new(HashSet::new()),
            refresh_secs: AtomicU64::new(MIN_KNOWN_REFRESH_SECS),
        }
    }

    /// Whether `name` is currently known to the registry
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    /// Replace the set and adopt the server-advised interval, clamped to
    /// the 30-second minimum
    fn replace(&self, names: HashSet<String>, advised_millis: i64) {
        let secs = if advised_millis < 30_000 {
            MIN_KNOWN_REFRESH_SECS
        } else {
            #[allow(clippy::cast_sign_loss)]
            {
                (advised_millis / 1000) as u64
            }
        };

        *self.names.write() = names;
        self.refresh_secs.store(secs, Ordering::Release);
    }

    fn refresh_secs(&self) -> u64 {
        self.refresh_secs.load(Ordering::Acquire)
    }
}

/// Client-side cache of the remote service registry
pub struct ServiceRegistry {
    store: Store<ServiceRecord>,
    servers: ServerPool,
    known: KnownServices,
    selector: InstanceSelector,
    fetcher: Arc<dyn Fetch>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    client_identity: String,
    push_port: PushPort,
    cancel: CancellationToken,
}

impl ServiceRegistry {
    /// Create a registry, warm-starting the store from the cache directory
    ///
    /// Every file in the cache directory is named by its cache key and
    /// holds the last successfully parsed response body; malformed files
    /// are skipped. The directory is created if missing.
    ///
    /// `push_port` must be the same cell the fetcher advertises on, so
    /// that once the push listener binds, outbound fetches carry the
    /// bound port.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(
        config: RegistryConfig,
        fetcher: Arc<dyn Fetch>,
        clock: Arc<dyn Clock>,
        push_port: PushPort,
    ) -> RegistryResult<Arc<Self>> {
        config.validate()?;

        let client_identity = if config.client_key.is_empty() {
            crate::net::local_ip().to_string()
        } else {
            config.client_key.clone()
        };

        let registry = Arc::new(Self {
            store: Store::new(),
            servers: ServerPool::new(config.servers.clone(), Arc::clone(&clock)),
            known: KnownServices::new(),
            selector: InstanceSelector::new(),
            fetcher,
            clock,
            config,
            client_identity,
            push_port,
            cancel: CancellationToken::new(),
        });

        registry.load_cache();

        Ok(registry)
    }

    /// Start the background loops and, when enabled, the push listener
    ///
    /// The known-services set is refreshed once synchronously so the first
    /// membership tests have data.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RegistryError::ListenerBindExhausted`] if
    /// push is enabled and the listener cannot bind; the caller may retry
    /// with push disabled to degrade to pull-only operation.
    pub async fn start(self: &Arc<Self>) -> RegistryResult<()> {
        if self.config.enable_push {
            let listener = PushListener::bind(Arc::clone(self)).await?;
            tokio::spawn(listener.run());
        }

        self.refresh_known_names().await;

        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.known_names_loop().await });

        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.pull_refresh_loop().await });

        info!("registry started, cache dir: {:?}", self.config.cache_dir);
        Ok(())
    }

    /// Signal every background loop and the push listener to stop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// The record store (shared with the push listener)
    #[must_use]
    pub fn store(&self) -> &Store<ServiceRecord> {
        &self.store
    }

    /// Shared cell carrying the push listener's bound port
    #[must_use]
    pub fn push_port(&self) -> PushPort {
        self.push_port.clone()
    }

    /// Cancellation token observed by all background activities
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The local client identity used as the push-path affinity key
    #[must_use]
    pub fn client_identity(&self) -> &str {
        &self.client_identity
    }

    /// Whether `name` is currently present in the known-services set
    #[must_use]
    pub fn registered(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    /// Whether the front end should treat `name` as registry-managed
    ///
    /// True when the name is in the known-services set or a record for it
    /// is already cached under the given affinity key.
    #[must_use]
    pub fn managed(&self, name: &str, client_key: &str) -> bool {
        self.registered(name) || self.store.contains(&cache_key(name, client_key))
    }

    /// Get the cached record for `(service, client_key)`, filling on miss
    ///
    /// A hit returns the cached record as-is, even if stale; staleness is
    /// reconciled by the background refresh loop, never the read path. A
    /// miss synchronously inserts a placeholder (preventing duplicate
    /// concurrent fills) and issues one blocking fetch.
    ///
    /// # Errors
    ///
    /// Propagates the no-server-available configuration invariant from the
    /// endpoint pool on the miss path.
    pub async fn get_or_fetch(
        &self,
        service: &str,
        client_key: &str,
    ) -> RegistryResult<ServiceRecord> {
        let key = cache_key(service, client_key);

        if let Some(record) = self.store.get(&key) {
            return Ok(record);
        }

        debug!("record not found in cache: {key}");
        self.store
            .insert(key, self.placeholder(service, self.clock.now_millis()));

        self.fetch_now(service, client_key).await
    }

    /// Select one instance for `(service, client_key)` via weighted rotation
    ///
    /// # Errors
    ///
    /// Returns the no-usable-instances configuration invariant when the
    /// record cannot serve, and propagates miss-path fetch failures.
    pub async fn select_instance(
        &self,
        service: &str,
        client_key: &str,
    ) -> RegistryResult<Instance> {
        let record = self.get_or_fetch(service, client_key).await?;
        self.selector.select_next(service, &record)
    }

    /// The full weighted expansion for `(service, client_key)`
    ///
    /// Returns an empty list when the record has no usable instances.
    pub async fn instances(&self, service: &str, client_key: &str) -> Vec<Instance> {
        match self.get_or_fetch(service, client_key).await {
            Ok(record) => InstanceSelector::expand(&record).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Fetch `(service, client_key)` from the control plane right now
    ///
    /// On success the store entry and its on-disk copy are replaced. On
    /// failure the previous record is retained but its refresh timestamp is
    /// bumped, so retries stay TTL-paced instead of hot-looping:
    ///
    /// - empty body (transport failure / non-2xx): empty record returned
    /// - parse failure: name-only record returned, stale record retained
    /// - empty result: record with the name is stored; selection must fail
    ///
    /// # Errors
    ///
    /// Only the no-server-available configuration invariant propagates.
    pub async fn fetch_now(
        &self,
        service: &str,
        client_key: &str,
    ) -> RegistryResult<ServiceRecord> {
        let mut params = vec![("dom".to_string(), service.to_string())];
        if !client_key.is_empty() {
            params.push(("clientIP".to_string(), client_key.to_string()));
        }

        let server = self.servers.next_server()?;
        let url = self.endpoint_url(&server, SERVICE_QUERY_PATH);
        let body = self.fetcher.get(&url, &params).await;

        let key = cache_key(service, client_key);
        let now = self.clock.now_millis();

        if body.is_empty() {
            warn!("empty result from server, service: {service}");
            self.bump_refresh_timestamp(&key, now);
            return Ok(ServiceRecord::default());
        }

        match parse_record(&body) {
            Ok(mut record) => {
                record.last_ref_millis = now;
                self.persist(&key, &body);
                self.store.insert(key, record.clone());
                Ok(record)
            }
            Err(RecordError::EmptyInstances { name }) => {
                // The name is still usable for bookkeeping; the stored
                // record must fail selection until instances reappear.
                let record = self.placeholder(&name, now);
                self.store.insert(key, record.clone());
                Ok(record)
            }
            Err(RecordError::Parse { .. }) => {
                self.bump_refresh_timestamp(&key, now);
                Ok(ServiceRecord {
                    name: service.to_string(),
                    ..ServiceRecord::default()
                })
            }
        }
    }

    /// One pass of the pull-refresh scan
    ///
    /// Refreshes every record that is past its TTL and whose service name
    /// is still registered. Unregistered services are left stale
    /// intentionally; they age out of active refresh without deletion.
    pub async fn refresh_pass(&self) {
        let now = self.clock.now_millis();

        for (key, record) in self.store.entries() {
            let (service, client_key) = split_cache_key(&key);

            if record.is_stale(now) && self.registered(service) {
                if let Err(e) = self.fetch_now(service, client_key).await {
                    error!("refresh failed for {key}: {e}");
                }
            }
        }
    }

    async fn pull_refresh_loop(&self) {
        let mut interval = tokio::time::interval(REFRESH_SCAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("pull-refresh loop stopped");
                    break;
                }
                _ = interval.tick() => self.refresh_pass().await,
            }
        }
    }

    /// Refresh the known-services set from the control plane
    ///
    /// Tries the flat payload shape first and falls back to the grouped
    /// mapping shape. Adopts the server-advised interval, clamped to 30s.
    pub async fn refresh_known_names(&self) {
        let server = match self.servers.next_server() {
            Ok(server) => server,
            Err(e) => {
                error!("cannot refresh known services: {e}");
                return;
            }
        };

        let url = self.endpoint_url(&server, ALL_NAMES_PATH);
        let body = self.fetcher.get(&url, &[]).await;
        if body.is_empty() {
            return;
        }

        match parse_known_names(&body) {
            Ok(parsed) => {
                debug!("known services refreshed, {} names", parsed.names.len());
                self.known
                    .replace(parsed.names.into_iter().collect(), parsed.cache_millis);
            }
            Err(e) => error!("failed to parse known-services payload: {e}"),
        }
    }

    async fn known_names_loop(&self) {
        loop {
            let secs = self.known.refresh_secs();
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("known-services loop stopped");
                    break;
                }
                () = tokio::time::sleep(Duration::from_secs(secs)) => {
                    self.refresh_known_names().await;
                }
            }
        }
    }

    /// Empty placeholder record carrying the configured default TTL
    fn placeholder(&self, service: &str, now: i64) -> ServiceRecord {
        let mut record = ServiceRecord::placeholder(service, now);
        record.cache_millis = self.config.default_cache_millis;
        record
    }

    fn endpoint_url(&self, server: &str, path: &str) -> String {
        // Entries may carry their own port; bare hosts get the configured one.
        if server.contains(':') {
            format!("http://{server}{path}")
        } else {
            format!("http://{server}:{}{path}", self.config.server_port)
        }
    }

    fn bump_refresh_timestamp(&self, key: &str, now: i64) {
        if let Some(mut record) = self.store.get(key) {
            record.last_ref_millis = now;
            self.store.insert(key.to_string(), record);
        }
    }

    fn load_cache(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.config.cache_dir) {
            warn!("cannot create cache dir {:?}: {e}", self.config.cache_dir);
            return;
        }

        let entries = match std::fs::read_dir(&self.config.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read cache dir {:?}: {e}", self.config.cache_dir);
                return;
            }
        };

        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(key) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };

            let body = match std::fs::read_to_string(&path) {
                Ok(body) => body,
                Err(e) => {
                    warn!("failed to read cache file {path:?}: {e}");
                    continue;
                }
            };

            match parse_record(&body) {
                Ok(record) => {
                    self.store.insert(key, record);
                    loaded += 1;
                }
                Err(_) => continue,
            }
        }

        info!("finished loading cache, {loaded} records");
    }

    fn persist(&self, key: &str, body: &str) {
        let path = self.config.cache_dir.join(key);
        if let Err(e) = std::fs::write(&path, body) {
            // Best effort: persistence failures never fail a fetch.
            error!("failed to write cache file {path:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Scripted fetcher mapping endpoint paths to canned bodies
    struct ScriptedFetch {
        responses: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetch {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn respond(&self, path_fragment: &str, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(path_fragment.to_string(), body.to_string());
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Fetch for ScriptedFetch {
        async fn get(&self, url: &str, _params: &[(String, String)]) -> String {
            self.calls.lock().unwrap().push(url.to_string());
            let responses = self.responses.lock().unwrap();
            responses
                .iter()
                .find(|(fragment, _)| url.contains(fragment.as_str()))
                .map(|(_, body)| body.clone())
                .unwrap_or_default()
        }
    }

    fn test_config(cache_dir: PathBuf) -> RegistryConfig {
        crate::config::load_config_str(&format!(
            r#"{{"servers": ["127.0.0.1:18848"], "cache_dir": {:?}, "enable_push": false}}"#,
            cache_dir
        ))
        .unwrap()
    }

    fn build(
        cache_dir: PathBuf,
    ) -> (Arc<ServiceRegistry>, Arc<ScriptedFetch>, Arc<ManualClock>) {
        let fetch = Arc::new(ScriptedFetch::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = ServiceRegistry::new(
            test_config(cache_dir),
            Arc::clone(&fetch) as Arc<dyn Fetch>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            PushPort::new(),
        )
        .unwrap();
        (registry, fetch, clock)
    }

    const BODY: &str = r#"{"dom":"svcA","cacheMillis":10000,"hosts":[{"ip":"2.2.2.2","port":80,"weight":1.0,"valid":true}]}"#;

    #[tokio::test]
    async fn test_miss_fills_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, fetch, _clock) = build(dir.path().to_path_buf());
        fetch.respond(SERVICE_QUERY_PATH, BODY);

        let record = registry.get_or_fetch("svcA", "").await.unwrap();
        assert_eq!(record.instances.len(), 1);
        assert_eq!(fetch.call_count(), 1);

        // Second lookup is a pure cache hit.
        let record = registry.get_or_fetch("svcA", "").await.unwrap();
        assert_eq!(record.instances[0].ip, "2.2.2.2");
        assert_eq!(fetch.call_count(), 1);

        // The body was persisted under the cache key.
        let persisted = std::fs::read_to_string(dir.path().join("svcA@@")).unwrap();
        assert_eq!(persisted, BODY);
    }

    #[tokio::test]
    async fn test_cold_start_from_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svcA@@"), BODY).unwrap();

        // No scripted responses: any network fetch would come back empty.
        let (registry, fetch, _clock) = build(dir.path().to_path_buf());

        let record = registry.get_or_fetch("svcA", "").await.unwrap();
        assert_eq!(record.instances[0].ip, "2.2.2.2");
        assert_eq!(fetch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_body_bumps_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _fetch, clock) = build(dir.path().to_path_buf());

        let record = registry.get_or_fetch("svcB", "").await.unwrap();
        assert!(record.instances.is_empty());

        // The placeholder keeps its refresh timestamp current, so a fill
        // failure does not hot-loop faster than the TTL.
        let stored = registry.store().get("svcB@@").unwrap();
        assert_eq!(stored.last_ref_millis, clock.now_millis());
        assert!(!stored.is_stale(clock.now_millis() + 1000));
    }

    #[tokio::test]
    async fn test_empty_result_record_fails_selection() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, fetch, _clock) = build(dir.path().to_path_buf());
        fetch.respond(SERVICE_QUERY_PATH, r#"{"dom":"svcC","hosts":[]}"#);

        let err = registry.select_instance("svcC", "").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::RegistryError::NoUsableInstances { .. }
        ));

        // The name was still recorded for bookkeeping.
        let stored = registry.store().get("svcC@@").unwrap();
        assert_eq!(stored.name, "svcC");
    }

    #[tokio::test]
    async fn test_refresh_pass_skips_unregistered() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, fetch, clock) = build(dir.path().to_path_buf());
        fetch.respond(SERVICE_QUERY_PATH, BODY);

        registry.get_or_fetch("svcA", "").await.unwrap();
        assert_eq!(fetch.call_count(), 1);

        // Past the TTL but not registered: left stale intentionally.
        clock.advance(60_000);
        registry.refresh_pass().await;
        assert_eq!(fetch.call_count(), 1);

        // Registering the name makes the next pass refresh it.
        fetch.respond(ALL_NAMES_PATH, r#"{"doms":["svcA"],"cacheMillis":60000}"#);
        registry.refresh_known_names().await;
        registry.refresh_pass().await;
        assert_eq!(fetch.call_count(), 3); // names fetch + record refresh
    }

    #[tokio::test]
    async fn test_fresh_record_not_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, fetch, clock) = build(dir.path().to_path_buf());
        fetch.respond(SERVICE_QUERY_PATH, BODY);
        fetch.respond(ALL_NAMES_PATH, r#"{"doms":["svcA"],"cacheMillis":60000}"#);

        registry.refresh_known_names().await;
        registry.get_or_fetch("svcA", "").await.unwrap();
        let calls = fetch.call_count();

        // Within the advised TTL nothing is stale.
        clock.advance(5_000);
        registry.refresh_pass().await;
        assert_eq!(fetch.call_count(), calls);
    }

    #[tokio::test]
    async fn test_known_names_interval_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, fetch, _clock) = build(dir.path().to_path_buf());
        fetch.respond(ALL_NAMES_PATH, r#"{"doms":["a"],"cacheMillis":5000}"#);

        registry.refresh_known_names().await;
        assert!(registry.registered("a"));
        assert_eq!(registry.known.refresh_secs(), 30);
    }

    #[tokio::test]
    async fn test_managed_considers_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, fetch, _clock) = build(dir.path().to_path_buf());
        fetch.respond(SERVICE_QUERY_PATH, BODY);

        assert!(!registry.managed("svcA", ""));
        registry.get_or_fetch("svcA", "").await.unwrap();
        assert!(registry.managed("svcA", ""));
    }

    #[tokio::test]
    async fn test_affinity_keys_partition_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, fetch, _clock) = build(dir.path().to_path_buf());
        fetch.respond(SERVICE_QUERY_PATH, BODY);

        registry.get_or_fetch("svcA", "10.0.0.1").await.unwrap();
        registry.get_or_fetch("svcA", "10.0.0.2").await.unwrap();

        assert!(registry.store().contains("svcA@@10.0.0.1"));
        assert!(registry.store().contains("svcA@@10.0.0.2"));
        assert_eq!(fetch.call_count(), 2);
    }
}
