//! Cross-thread marshalling and multi-party bookkeeping.

mod support;

use driftwave_flow_core::Method;
use pretty_assertions::assert_eq;
use support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operations_behave_identically_from_any_thread() {
    let h = Harness::new();
    h.fm.set_self_user_id("alice").await.unwrap();
    h.start_with_config().await;

    // Same operations, one from a plain OS thread, one from a task.
    let handle = tokio::runtime::Handle::current();
    let fm = h.fm.clone();
    let joined = std::thread::spawn(move || {
        handle.block_on(async move {
            fm.user_add("cv1", "bob", Some("Bob")).await?;
            fm.acquire_flows("cv1", Some("se1")).await
        })
    })
    .join()
    .expect("thread");
    joined.expect("threaded ops");

    h.fm.user_add("cv1", "carol", None).await.unwrap();

    assert_eq!(h.fm.users_count("cv1").await.unwrap(), 2);
    // The threaded acquire produced the same POST a task-side acquire
    // would: one flows request for the conversation.
    assert_eq!(h.transport.count(Method::Post, "/conversations/cv1/call/flows"), 1);
}

#[tokio::test]
async fn a_userflow_is_bound_to_at_most_one_flow() {
    let h = Harness::new();
    h.fm.set_self_user_id("alice").await.unwrap();
    h.start_with_config().await;
    h.fm.acquire_flows("cv1", None).await.unwrap();
    h.respond_flows(flows_body(&[("f1", "bob", true)])).await;

    // A second flow towards the same user reuses the userflow and
    // steals the binding.
    let add = flow_add_event("cv1", &[("f2", "bob", false)]);
    assert!(h
        .fm
        .process_event(driftwave_backend_api::CONTENT_TYPE_JSON, &add)
        .await
        .unwrap());

    assert_eq!(h.fm.users_count("cv1").await.unwrap(), 1);
    assert_eq!(h.engine.flow_count(), 1, "one mediaflow per userflow");
}

#[tokio::test]
async fn conference_order_is_sorted_by_user_id() {
    let h = Harness::new();
    h.fm.set_self_user_id("alice").await.unwrap();
    h.start_with_config().await;
    h.fm.acquire_flows("cv1", None).await.unwrap();
    h.respond_flows(flows_body(&[("f1", "zack", true), ("f2", "anna", true)]))
        .await;

    h.engine.flow(0).start_rtp();
    h.engine.flow(1).start_rtp();
    h.fm.has_media("cv1").await.unwrap();

    let events = h.observer.events();
    let (_, order) = events.conference_orders.last().unwrap();
    assert_eq!(order, &vec!["anna".to_string(), "zack".to_string()]);

    // The media engine received the decoder handles in the same order.
    let updates = h.engine.conference_updates();
    assert_eq!(updates.last().unwrap().len(), 2);
}

#[tokio::test]
async fn users_are_purged_when_the_backend_drops_them() {
    let h = Harness::new();
    h.fm.set_self_user_id("alice").await.unwrap();
    h.start_with_config().await;
    h.fm.user_add("cv1", "bob", None).await.unwrap();
    h.fm.user_add("cv1", "carol", None).await.unwrap();
    h.fm.acquire_flows("cv1", None).await.unwrap();

    // The backend only assigns a flow for bob; carol is purged.
    h.respond_flows(flows_body(&[("f1", "bob", true)])).await;
    assert_eq!(h.fm.users_count("cv1").await.unwrap(), 1);
}
