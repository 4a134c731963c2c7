//! End-to-end key delivery: master requests keys, encrypts, the slave
//! retrieves the same keys by id and decrypts.

use mockito::{mock, server_url, Matcher};
use qkdmate_client::{ClientConfig, EtsiClient};
use qkdmate_keys::{CryptoEngine, EtsiKeySource, KeyError, KeyPool, PoolConfig};
use std::path::PathBuf;
use std::sync::Arc;

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

fn pool_config(node: &str, partner: &str) -> PoolConfig {
    let mut config = PoolConfig::new(node, partner);
    config.min_keys = 1;
    config.max_keys = 2;
    config
}

const KEYS_BODY: &str = r#"{"keys": [
    {"key_ID": "k1", "key": "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY="},
    {"key_ID": "k2", "key": "ZmVkY2JhOTg3NjU0MzIxMGZlZGNiYTk4NzY1NDMyMTA="}
]}"#;

#[tokio::test]
async fn test_master_slave_envelope_round_trip() -> anyhow::Result<()> {
    qkdmate_logging::init_console_logging("itest-flow", "warn");

    let enc = mock("GET", "/api/v1/keys/Bob2/enc_keys")
        .match_query(Matcher::UrlEncoded("number".into(), "2".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(KEYS_BODY)
        .create();
    let dec = mock("GET", "/api/v1/keys/Alice2/dec_keys")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(KEYS_BODY)
        .create();

    let alice_pool = KeyPool::new(
        pool_config("Alice2", "Bob2"),
        Arc::new(EtsiKeySource::master(kme_client(), "Bob2")),
    )
    .await;
    let alice = CryptoEngine::new(alice_pool, "Alice2");

    let envelope = alice.encrypt_message(b"quantum safe", "Bob2").await?;
    assert!(envelope.key_id == "k1" || envelope.key_id == "k2");
    enc.assert();

    let bob_pool = KeyPool::new(
        pool_config("Bob2", "Alice2"),
        Arc::new(EtsiKeySource::slave(kme_client(), "Alice2")),
    )
    .await;
    let imported = bob_pool.retrieve_keys(&[envelope.key_id.clone()]).await?;
    assert_eq!(imported, 2);
    dec.assert();

    // the envelope crosses the wire as JSON
    let wire = serde_json::to_string(&envelope)?;
    let received = serde_json::from_str(&wire)?;

    let bob = CryptoEngine::new(bob_pool, "Bob2");
    let plaintext = bob.decrypt_message(&received).await?;
    assert_eq!(plaintext, b"quantum safe");
    Ok(())
}

#[tokio::test]
async fn test_link_status_before_requesting_keys() -> anyhow::Result<()> {
    let _m = mock("GET", "/api/v1/keys/Carol1/status")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "source_KME_ID": "AAA1",
                "target_KME_ID": "BBB1",
                "master_SAE_ID": "Alice2",
                "slave_SAE_ID": "Carol1",
                "key_size": 256,
                "stored_key_count": 4,
                "max_key_count": 100000,
                "max_key_per_request": 128,
                "max_key_size": 1024,
                "min_key_size": 64,
                "max_SAE_ID_count": 0
            }"#,
        )
        .create();

    let status = kme_client().get_status("Carol1").await?;
    assert_eq!(status.slave_sae_id, "Carol1");
    assert_eq!(status.stored_key_count, 4);
    Ok(())
}

#[tokio::test]
async fn test_kme_outage_surfaces_as_exhaustion() {
    let _m = mock("GET", "/api/v1/keys/Dave2/enc_keys")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message": "no keys available"}"#)
        .create();

    let pool = KeyPool::new(
        pool_config("Alice2", "Dave2"),
        Arc::new(EtsiKeySource::master(kme_client(), "Dave2")),
    )
    .await;

    let err = pool.acquire_fresh_key().await.unwrap_err();
    assert!(matches!(err, KeyError::Exhausted(_)));
}

#[tokio::test]
async fn test_slave_source_rejects_refill_locally() {
    let m = mock("GET", "/api/v1/keys/Erin2/dec_keys")
        .match_query(Matcher::Any)
        .expect(0)
        .create();

    let pool = KeyPool::new(
        pool_config("Bob2", "Erin2"),
        Arc::new(EtsiKeySource::slave(kme_client(), "Erin2")),
    )
    .await;

    // a slave pool only imports by id; the refill path is the master's
    let err = pool.force_refresh(Some(2)).await.unwrap_err();
    assert!(matches!(err, KeyError::Validation(_)));
    m.assert();
}
