//! Integration tests for the registry lifecycle
//!
//! Exercises the paths that cross module boundaries: cold-start recovery
//! from the cache directory, the dual-writer race between push and pull,
//! and the full start/shutdown lifecycle with a live UDP push listener.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use svcreg::clock::{Clock, ManualClock, SystemClock};
use svcreg::fetch::Fetch;
use svcreg::record::ServiceRecord;
use svcreg::registry::{ServiceRegistry, SERVICE_QUERY_PATH};
use svcreg::{load_config_str, PushListener, PushPort, RegistryConfig};

static TRACING: Once = Once::new();

/// Route crate logs through a subscriber honoring `RUST_LOG`
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Fetcher answering from a canned path to body table
struct ScriptedFetch {
    responses: Mutex<HashMap<String, String>>,
}

impl ScriptedFetch {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
        }
    }

    fn respond(&self, path_fragment: &str, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(path_fragment.to_string(), body.to_string());
    }
}

#[async_trait]
impl Fetch for ScriptedFetch {
    async fn get(&self, url: &str, _params: &[(String, String)]) -> String {
        let responses = self.responses.lock().unwrap();
        responses
            .iter()
            .find(|(fragment, _)| url.contains(fragment.as_str()))
            .map(|(_, body)| body.clone())
            .unwrap_or_default()
    }
}

fn config(dir: &Path, enable_push: bool) -> RegistryConfig {
    load_config_str(&format!(
        r#"{{
            "servers": ["127.0.0.1:18848"],
            "cache_dir": {:?},
            "client_key": "9.9.9.9",
            "enable_push": {enable_push}
        }}"#,
        dir
    ))
    .unwrap()
}

fn record_body(service: &str, ip: &str) -> String {
    format!(
        r#"{{"dom":"{service}","cacheMillis":10000,"hosts":[{{"ip":"{ip}","port":80,"weight":1.0,"valid":true}}]}}"#
    )
}

#[tokio::test]
async fn cold_start_serves_persisted_record_without_network() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("svcA@@"), record_body("svcA", "2.2.2.2")).unwrap();

    // No scripted responses: every fetch would come back empty.
    let registry = ServiceRegistry::new(
        config(dir.path(), false),
        Arc::new(ScriptedFetch::new()),
        Arc::new(ManualClock::new(0)) as Arc<dyn Clock>,
        PushPort::new(),
    )
    .unwrap();

    let record = registry.get_or_fetch("svcA", "").await.unwrap();
    assert_eq!(record.instances.len(), 1);
    assert_eq!(record.instances[0].ip, "2.2.2.2");

    let instance = registry.select_instance("svcA", "").await.unwrap();
    assert_eq!(instance.ip, "2.2.2.2");
}

#[tokio::test]
async fn concurrent_push_and_pull_leave_one_whole_value() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let fetch = Arc::new(ScriptedFetch::new());
    fetch.respond(SERVICE_QUERY_PATH, &record_body("svcR", "1.1.1.1"));

    let registry = ServiceRegistry::new(
        config(dir.path(), false),
        Arc::clone(&fetch) as Arc<dyn Fetch>,
        Arc::new(SystemClock),
        PushPort::new(),
    )
    .unwrap();

    // Sentinel written on the push path: same key, distinct instance set.
    let pushed: ServiceRecord =
        serde_json::from_str(&record_body("svcR", "3.3.3.3")).unwrap();

    let puller = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for _ in 0..200 {
                registry.fetch_now("svcR", "9.9.9.9").await.unwrap();
            }
        })
    };
    let pusher = {
        let registry = Arc::clone(&registry);
        let pushed = pushed.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                registry
                    .store()
                    .insert("svcR@@9.9.9.9".to_string(), pushed.clone());
            }
        })
    };

    puller.await.unwrap();
    pusher.await.unwrap();

    // Never a torn write, never both applied partially: the final record
    // equals exactly one of the two sentinels.
    let stored = registry.store().get("svcR@@9.9.9.9").unwrap();
    let ip = &stored.instances[0].ip;
    assert!(ip == "1.1.1.1" || ip == "3.3.3.3", "unexpected ip {ip}");
    assert_eq!(stored.instances.len(), 1);
}

#[tokio::test]
async fn lifecycle_with_push_listener() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let fetch = Arc::new(ScriptedFetch::new());

    let registry = ServiceRegistry::new(
        config(dir.path(), false),
        Arc::clone(&fetch) as Arc<dyn Fetch>,
        Arc::new(SystemClock),
        PushPort::new(),
    )
    .unwrap();

    // Bind the listener directly so the test controls its lifetime.
    let listener = PushListener::bind(Arc::clone(&registry)).await.unwrap();
    let port = listener.local_port().unwrap();
    assert!((54_951..55_951).contains(&port));
    let listener_task = tokio::spawn(listener.run());

    // A push notification lands in the store keyed by the client identity.
    let data = record_body("svcP", "4.4.4.4").replace('"', "\\\"");
    let envelope = format!(r#"{{"type":"dom","data":"{data}","lastRefTime":77}}"#);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(envelope.as_bytes(), ("127.0.0.1", port))
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let ack = String::from_utf8(buf[..n].to_vec()).unwrap();
    assert!(ack.contains("push-ack"));
    assert!(ack.contains("77"));

    // The pushed record is immediately selectable.
    let instance = registry.select_instance("svcP", "9.9.9.9").await.unwrap();
    assert_eq!(instance.ip, "4.4.4.4");

    // Cancellation must actually stop the listener task.
    registry.shutdown();
    tokio::time::timeout(Duration::from_secs(5), listener_task)
        .await
        .expect("listener did not stop after shutdown")
        .unwrap();
}

#[tokio::test]
async fn fetch_replaces_persisted_body() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let fetch = Arc::new(ScriptedFetch::new());
    fetch.respond(SERVICE_QUERY_PATH, &record_body("svcW", "5.5.5.5"));

    let registry = ServiceRegistry::new(
        config(dir.path(), false),
        Arc::clone(&fetch) as Arc<dyn Fetch>,
        Arc::new(SystemClock),
        PushPort::new(),
    )
    .unwrap();

    registry.get_or_fetch("svcW", "").await.unwrap();
    let first = std::fs::read_to_string(dir.path().join("svcW@@")).unwrap();
    assert!(first.contains("5.5.5.5"));

    // A newer body overwrites the same file on the next fetch.
    fetch.respond(SERVICE_QUERY_PATH, &record_body("svcW", "6.6.6.6"));
    registry.fetch_now("svcW", "").await.unwrap();
    let second = std::fs::read_to_string(dir.path().join("svcW@@")).unwrap();
    assert!(second.contains("6.6.6.6"));
}
