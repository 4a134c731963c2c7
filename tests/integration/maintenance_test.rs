//! Pool maintenance against a mock KME: refill, snapshot persistence,
//! restart recovery, and cooperative shutdown of the background task.

use mockito::{mock, server_url, Matcher};
use qkdmate_client::{ClientConfig, EtsiClient};
use qkdmate_keys::{EtsiKeySource, KeyPool, PoolConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name)
}

fn kme_client() -> EtsiClient {
    let mut config = ClientConfig::new(
        server_url(),
        fixture("client.crt"),
        fixture("client.key"),
        fixture("ca.crt"),
    );
    config.retries = 0;
    config.delay_ms = 10;
    EtsiClient::new(config).unwrap()
}

const KEYS_BODY: &str = r#"{"keys": [
    {"key_ID": "m1", "key": "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY="},
    {"key_ID": "m2", "key": "ZmVkY2JhOTg3NjU0MzIxMGZlZGNiYTk4NzY1NDMyMTA="}
]}"#;

#[tokio::test]
async fn test_snapshot_survives_restart_without_refetching() -> anyhow::Result<()> {
    qkdmate_logging::init_console_logging("itest-maintenance", "warn");

    let m = mock("GET", "/api/v1/keys/Bob9/enc_keys")
        .match_query(Matcher::UrlEncoded("number".into(), "2".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(KEYS_BODY)
        .expect(1)
        .create();

    let dir = tempfile::tempdir()?;
    let mut config = PoolConfig::new("Alice9", "Bob9");
    config.min_keys = 1;
    config.max_keys = 2;
    config.storage_path = Some(dir.path().join("pool.json"));

    let pool = KeyPool::new(
        config.clone(),
        Arc::new(EtsiKeySource::master(kme_client(), "Bob9")),
    )
    .await;
    pool.run_maintenance_once().await;
    assert_eq!(pool.status().await.available_keys, 2);

    // a restarted node reloads the snapshot and is already above the
    // threshold, so its maintenance cycle makes no network call
    let restarted = KeyPool::new(
        config,
        Arc::new(EtsiKeySource::master(kme_client(), "Bob9")),
    )
    .await;
    assert_eq!(restarted.status().await.available_keys, 2);
    restarted.run_maintenance_once().await;

    m.assert();
    Ok(())
}

#[tokio::test]
async fn test_background_task_refills_and_stops() {
    let _m = mock("GET", "/api/v1/keys/BobT/enc_keys")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(KEYS_BODY)
        .create();

    let mut config = PoolConfig::new("AliceT", "BobT");
    config.min_keys = 1;
    config.max_keys = 2;

    let pool = KeyPool::new(
        config,
        Arc::new(EtsiKeySource::master(kme_client(), "BobT")),
    )
    .await;

    pool.start_maintenance(Duration::from_millis(20)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.stop_maintenance().await;

    assert_eq!(pool.status().await.available_keys, 2);
}
