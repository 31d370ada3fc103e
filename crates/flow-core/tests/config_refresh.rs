//! Call-configuration fetch, retry, refresh, and the post-pending queue.

mod support;

use std::time::Duration;

use driftwave_flow_core::Method;
use pretty_assertions::assert_eq;
use support::*;

#[tokio::test(start_paused = true)]
async fn acquires_wait_for_the_configuration() {
    let h = Harness::new();
    h.fm.set_self_user_id("alice").await.unwrap();
    h.fm.start().await.unwrap();
    assert!(!h.fm.is_ready().await.unwrap());

    // Acquired before the config response: the POST is held back.
    h.fm.acquire_flows("cv1", None).await.unwrap();
    assert!(h.transport.find(Method::Post, "/call/flows").is_none());

    let config = h.transport.expect(Method::Get, "/calls/config");
    h.respond_json(config.rr.unwrap(), 200, config_body()).await;

    assert!(h.fm.is_ready().await.unwrap());
    assert!(h.transport.find(Method::Post, "/call/flows").is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_retries_after_a_minute() {
    let h = Harness::new();
    h.fm.start().await.unwrap();

    let first = h.transport.expect(Method::Get, "/calls/config");
    h.respond_json(first.rr.unwrap(), 500, "{}".to_string()).await;
    assert!(!h.fm.is_ready().await.unwrap());
    assert_eq!(h.transport.count(Method::Get, "/calls/config"), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    h.fm.is_ready().await.unwrap();
    assert_eq!(h.transport.count(Method::Get, "/calls/config"), 2);

    let second = h.transport.expect(Method::Get, "/calls/config");
    h.respond_json(second.rr.unwrap(), 200, config_body()).await;
    assert!(h.fm.is_ready().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn configuration_refreshes_before_expiry() {
    let h = Harness::new();
    h.start_with_config().await;
    assert_eq!(h.transport.count(Method::Get, "/calls/config"), 1);

    // 90% of the 7200 second expiry.
    tokio::time::advance(Duration::from_secs(6480 + 1)).await;
    h.fm.is_ready().await.unwrap();
    assert_eq!(h.transport.count(Method::Get, "/calls/config"), 2);
}

#[tokio::test(start_paused = true)]
async fn token_refresh_refetches_the_configuration() {
    let h = Harness::new();
    h.start_with_config().await;
    assert_eq!(h.transport.count(Method::Get, "/calls/config"), 1);

    h.fm.refresh_access_token().await.unwrap();
    assert_eq!(h.transport.count(Method::Get, "/calls/config"), 2);

    // Acquires queue again until the new configuration arrives.
    h.fm.acquire_flows("cv1", None).await.unwrap();
    assert!(h.transport.find(Method::Post, "/call/flows").is_none());

    let refetch = h.transport.expect(Method::Get, "/calls/config");
    h.respond_json(refetch.rr.unwrap(), 200, config_body()).await;
    assert!(h.transport.find(Method::Post, "/call/flows").is_some());
}

#[tokio::test]
async fn empty_server_list_counts_as_failure() {
    let h = Harness::new();
    h.fm.start().await.unwrap();
    let config = h.transport.expect(Method::Get, "/calls/config");
    h.respond_json(
        config.rr.unwrap(),
        200,
        serde_json::json!({ "ice_servers": [] }).to_string(),
    )
    .await;
    assert!(!h.fm.is_ready().await.unwrap());
}
