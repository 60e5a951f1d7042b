mod common;

use std::sync::Arc;
use std::time::Duration;

use memring_client::{
    AuthConfig, CacheClient, CacheItem, Cas, ClientConfig, ClientMetrics, Expiration,
    MutationMode, SocketPoolConfig, Status, StoreMode, FLAG_RAW,
};
use serde::{Deserialize, Serialize};

use common::MockServer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    visits: u32,
}

fn pool_config() -> SocketPoolConfig {
    SocketPoolConfig {
        min_pool_size: 1,
        max_pool_size: 4,
        connection_timeout: Duration::from_millis(500),
        receive_timeout: Duration::from_millis(500),
        dead_timeout: Duration::from_secs(30),
        ..SocketPoolConfig::default()
    }
}

fn client_for(server: &MockServer) -> CacheClient {
    CacheClient::new(ClientConfig::new([server.addr()]).with_socket_pool(pool_config()))
        .expect("client")
}

#[test]
fn set_then_get_returns_value_and_cas() {
    let server = MockServer::start();
    let client = client_for(&server);
    let profile = Profile {
        name: "ada".to_string(),
        visits: 3,
    };

    let stored = client.set("profile:1", &profile, Expiration::Never);
    assert!(stored.success);
    assert_eq!(stored.status.code(), 0);
    assert!(!stored.cas.is_none());

    let first = client.get::<Profile>("profile:1");
    assert!(first.success);
    assert_eq!(first.value.as_ref(), Some(&profile));
    assert_eq!(first.cas, stored.cas);

    let again = client.get::<Profile>("profile:1");
    assert_eq!(again.cas, first.cas);
    assert_eq!(client.try_get::<Profile>("profile:1").map(|(_, cas)| cas), Some(stored.cas));
}

#[test]
fn stale_cas_is_a_conflict_not_a_miss() {
    let server = MockServer::start();
    let client = client_for(&server);

    let stored = client.set("foo123", "v", Expiration::Never);
    assert!(stored.success);
    assert!(stored.cas.get() > 0);

    let stale = Cas::new(stored.cas.get() - 1);
    let conflict = client.cas(StoreMode::Set, "foo123", "v2", Expiration::Never, stale);
    assert!(!conflict.success);
    assert_eq!(conflict.status, Status::KeyExists);
    assert_ne!(conflict.status, Status::KeyNotFound);

    let current = client.cas(StoreMode::Set, "foo123", "v2", Expiration::Never, stored.cas);
    assert!(current.success);
    assert_ne!(current.cas, stored.cas);
    assert_eq!(client.get_value::<String>("foo123").as_deref(), Some("v2"));
}

#[test]
fn add_and_replace_respect_existence() {
    let server = MockServer::start();
    let client = client_for(&server);

    assert_eq!(
        client.replace("k", &1, Expiration::Never).status,
        Status::KeyNotFound
    );
    assert!(client.add("k", &1, Expiration::Never).success);
    assert_eq!(client.add("k", &2, Expiration::Never).status, Status::KeyExists);
    assert!(client.replace("k", &3, Expiration::Never).success);
    assert_eq!(client.get_value::<i32>("k"), Some(3));
}

#[test]
fn counters_seed_and_clamp() {
    let server = MockServer::start();
    let client = client_for(&server);

    assert_eq!(client.increment("hits", 1, 10).value, Some(10));
    assert_eq!(client.increment("hits", 5, 10).value, Some(15));
    assert_eq!(client.decrement("hits", 100, 0).value, Some(0));

    let missing = client.mutate(
        MutationMode::Increment,
        "absent",
        1,
        None,
        Expiration::Never,
        Cas::NONE,
    );
    assert_eq!(missing.status, Status::KeyNotFound);
    assert!(!server.contains("absent"));

    assert!(client.set("text", "abc", Expiration::Never).success);
    assert_eq!(client.increment("text", 1, 0).status, Status::NonNumeric);
}

#[test]
fn append_and_prepend_edit_raw_items() {
    let server = MockServer::start();
    let client = client_for(&server);

    assert_eq!(client.append("log", b"x", Cas::NONE).status, Status::ItemNotStored);

    let raw = CacheItem::new(FLAG_RAW, &b"b"[..]);
    assert!(client
        .store_item(StoreMode::Set, "log", raw, Expiration::Never, Cas::NONE)
        .success);
    assert!(client.append("log", b"c", Cas::NONE).success);
    assert!(client.prepend("log", b"a", Cas::NONE).success);

    let item = client.get_item("log");
    assert_eq!(item.value.map(|item| item.data.to_vec()), Some(b"abc".to_vec()));
    assert_eq!(client.get_value::<String>("log").as_deref(), Some("abc"));
}

#[test]
fn delete_touch_and_misses() {
    let server = MockServer::start();
    let client = client_for(&server);

    let stored = client.set("gone", &true, Expiration::In(Duration::from_secs(60)));
    assert!(client.touch("gone", Expiration::Never).success);
    let gat = client.get_and_touch::<bool>("gone", Expiration::In(Duration::from_secs(5)));
    assert_eq!(gat.value, Some(true));

    let stale = Cas::new(stored.cas.get() + 100);
    assert_eq!(client.delete_cas("gone", stale).status, Status::KeyExists);
    assert!(client.delete("gone").success);

    let miss = client.get::<bool>("gone");
    assert!(!miss.success);
    assert_eq!(miss.status, Status::KeyNotFound);
    assert_eq!(client.get_value::<bool>("gone"), None);
    assert_eq!(client.touch("gone", Expiration::Never).status, Status::KeyNotFound);
}

#[test]
fn undecodable_value_reports_transcode() {
    let server = MockServer::start();
    let client = client_for(&server);

    assert!(client.set("n", "not a number", Expiration::Never).success);
    let result = client.get::<u64>("n");
    assert_eq!(result.status, Status::Transcode);
    assert!(result.message.is_some());
}

#[test]
fn invalid_keys_never_reach_the_server() {
    let server = MockServer::start();
    let client = client_for(&server);
    let before = server.requests();

    let result = client.set("has space", &1, Expiration::Never);
    assert_eq!(result.status, Status::InvalidRequest);
    assert_eq!(client.get::<i32>(&"x".repeat(300)).status, Status::InvalidRequest);
    assert_eq!(server.requests(), before);
}

#[test]
fn broadcast_commands_reach_every_node() {
    let a = MockServer::start();
    let b = MockServer::start();
    let client = CacheClient::new(
        ClientConfig::new([a.addr(), b.addr()]).with_socket_pool(pool_config()),
    )
    .unwrap();

    let versions = client.versions();
    assert_eq!(versions.len(), 2);
    assert!(versions
        .values()
        .all(|result| result.value.as_deref() == Some("1.6.21-mock")));

    for i in 0..20 {
        client.set(&format!("key{i}"), &i, Expiration::Never);
    }
    let stats = client.stats(None);
    let total: usize = stats
        .values()
        .filter_map(|result| result.value.as_ref())
        .flat_map(|entries| entries.iter())
        .filter(|(name, _)| name == "curr_items")
        .map(|(_, value)| value.parse::<usize>().unwrap())
        .sum();
    assert_eq!(total, 20);

    let flushed = client.flush_all(Duration::ZERO);
    assert!(flushed.values().all(|result| result.success));
    assert_eq!(a.item_count() + b.item_count(), 0);
}

#[test]
fn sasl_plain_authenticates_new_connections() {
    let server = MockServer::with_credentials("app", "s3cret");
    let config = ClientConfig::new([server.addr()])
        .with_socket_pool(pool_config())
        .with_authentication(AuthConfig {
            zone: String::new(),
            username: "app".to_string(),
            password: "s3cret".to_string(),
        });
    let client = CacheClient::new(config).unwrap();
    assert!(client.set("k", "v", Expiration::Never).success);
    assert_eq!(client.get_value::<String>("k").as_deref(), Some("v"));
}

#[test]
fn rejected_credentials_leave_node_dead() {
    let server = MockServer::with_credentials("app", "s3cret");
    let config = ClientConfig::new([server.addr()])
        .with_socket_pool(pool_config())
        .with_authentication(AuthConfig {
            zone: String::new(),
            username: "app".to_string(),
            password: "wrong".to_string(),
        });
    let client = CacheClient::new(config).unwrap();
    let result = client.get::<String>("k");
    assert_eq!(result.status, Status::NotAttempted);
    assert!(client.server_pool().working_nodes().is_empty());
}

#[test]
fn exhausted_pool_times_out_instead_of_blocking() {
    let server = MockServer::start();
    server.set_delay(Duration::from_millis(300));
    let config = ClientConfig::new([server.addr()]).with_socket_pool(SocketPoolConfig {
        min_pool_size: 1,
        max_pool_size: 1,
        connection_timeout: Duration::from_millis(50),
        receive_timeout: Duration::from_secs(2),
        dead_timeout: Duration::from_secs(30),
        ..SocketPoolConfig::default()
    });
    let client = Arc::new(CacheClient::new(config).unwrap());

    let slow = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || client.get_item("slow"))
    };
    std::thread::sleep(Duration::from_millis(50));
    let waited = client.get_item("fast");
    assert_eq!(waited.status, Status::PoolTimeout);
    assert_eq!(slow.join().unwrap().status, Status::KeyNotFound);
    assert_eq!(client.server_pool().working_nodes().len(), 1);
}

#[test]
fn metrics_observer_counts_outcomes() {
    let server = MockServer::start();
    let metrics = Arc::new(ClientMetrics::new());
    let client = CacheClient::builder(
        ClientConfig::new([server.addr()]).with_socket_pool(pool_config()),
    )
    .observer(metrics.clone())
    .build()
    .unwrap();

    let stored = client.set("m", &1, Expiration::Never);
    client.get::<i32>("m");
    client.get::<i32>("missing");
    client.cas(
        StoreMode::Set,
        "m",
        &2,
        Expiration::Never,
        Cas::new(stored.cas.get() + 1),
    );
    client.set("bad key", &1, Expiration::Never);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.requests_total, 5);
    assert_eq!(snapshot.misses_total, 1);
    assert_eq!(snapshot.conflicts_total, 1);
    assert_eq!(snapshot.errors_total, 1);
    assert_eq!(snapshot.inflight, 0);
    assert_eq!(snapshot.latency.samples, 5);
}

#[test]
fn shutdown_is_idempotent() {
    let server = MockServer::start();
    let client = client_for(&server);
    assert!(client.set("k", &1, Expiration::Never).success);

    client.shutdown();
    client.shutdown();
    assert_eq!(client.get::<i32>("k").status, Status::NotAttempted);
}
