//! Queueing of events for unknown flows and their replay after the flow
//! list arrives.

mod support;

use driftwave_backend_api::CONTENT_TYPE_JSON;
use driftwave_flow_core::Method;
use pretty_assertions::assert_eq;
use support::*;

async fn drive_to_answer(h: &Harness) {
    let put = h.transport.expect(Method::Put, "local_sdp");
    h.respond_empty(put.rr.unwrap(), 200).await;
    let answer = remote_sdp_event("cv1", "fX", "answer", "v=0 answer");
    assert!(h.fm.process_event(CONTENT_TYPE_JSON, &answer).await.unwrap());
}

fn candidate_log(h: &Harness) -> Vec<(String, String, u32)> {
    h.engine.flow(0).state.lock().candidates.clone()
}

#[tokio::test]
async fn candidates_before_flow_add_are_replayed_in_order() {
    let h = Harness::new();
    h.fm.set_self_user_id("alice").await.unwrap();
    h.start_with_config().await;
    h.fm.acquire_flows("cv1", None).await.unwrap();

    // Candidates for a flow the backend has not told us about yet.
    let early = candidates_event(
        "cv1",
        "fX",
        &[("candidate:1 first", "audio", 0), ("candidate:2 second", "audio", 0)],
    );
    assert!(h.fm.process_event(CONTENT_TYPE_JSON, &early).await.unwrap());

    // The flows response introduces fX and triggers the replay.
    h.respond_flows(flows_body(&[("fX", "bob", true)])).await;
    drive_to_answer(&h).await;

    // The control endpoint receives the same candidates after the add.
    let control = Harness::new();
    control.fm.set_self_user_id("alice").await.unwrap();
    control.start_with_config().await;
    control.fm.acquire_flows("cv1", None).await.unwrap();
    control
        .respond_flows(flows_body(&[("fX", "bob", true)]))
        .await;
    drive_to_answer(&control).await;
    let late = candidates_event(
        "cv1",
        "fX",
        &[("candidate:1 first", "audio", 0), ("candidate:2 second", "audio", 0)],
    );
    assert!(control
        .fm
        .process_event(CONTENT_TYPE_JSON, &late)
        .await
        .unwrap());

    assert_eq!(candidate_log(&h), candidate_log(&control));
    assert_eq!(candidate_log(&h).len(), 2);
}

#[tokio::test]
async fn replay_is_triggered_by_flow_add_events_too() {
    let h = Harness::new();
    h.fm.set_self_user_id("alice").await.unwrap();
    h.start_with_config().await;
    h.fm.acquire_flows("cv1", None).await.unwrap();
    h.respond_flows(flows_body(&[("f1", "bob", true)])).await;

    // An activation for a flow delivered only by a later flow-add event.
    let act = flow_active_event("cv1", "f2", true);
    assert!(h.fm.process_event(CONTENT_TYPE_JSON, &act).await.unwrap());

    let add = flow_add_event("cv1", &[("f2", "carol", false)]);
    assert!(h.fm.process_event(CONTENT_TYPE_JSON, &add).await.unwrap());

    // After the replay the f2 activation has been applied: two userflows.
    assert_eq!(h.fm.users_count("cv1").await.unwrap(), 2);
}

#[tokio::test]
async fn event_for_unknown_conversation_is_a_protocol_error() {
    let h = Harness::new();
    h.start_with_config().await;
    let ev = flow_active_event("cv-unknown", "f1", true);
    let err = h.fm.process_event(CONTENT_TYPE_JSON, &ev).await.unwrap_err();
    assert!(matches!(err, driftwave_flow_core::FlowError::Protocol(_)));
}

#[tokio::test]
async fn unknown_event_type_is_reported_unhandled() {
    let h = Harness::new();
    h.start_with_config().await;
    let ev = serde_json::json!({
        "type": "conversation.rename",
        "conversation": "cv1",
    })
    .to_string();
    assert!(!h.fm.process_event(CONTENT_TYPE_JSON, &ev).await.unwrap());
}

#[tokio::test]
async fn delete_for_unknown_flow_is_not_queued() {
    let h = Harness::new();
    h.fm.set_self_user_id("alice").await.unwrap();
    h.start_with_config().await;
    h.fm.acquire_flows("cv1", None).await.unwrap();
    h.respond_flows(flows_body(&[("f1", "bob", true)])).await;

    let del = flow_delete_event("cv1", "f9");
    let err = h.fm.process_event(CONTENT_TYPE_JSON, &del).await.unwrap_err();
    assert!(matches!(err, driftwave_flow_core::FlowError::Protocol(_)));

    // A later add of f9 must not resurrect the delete.
    let add = flow_add_event("cv1", &[("f9", "dave", false)]);
    assert!(h.fm.process_event(CONTENT_TYPE_JSON, &add).await.unwrap());
    assert_eq!(h.fm.users_count("cv1").await.unwrap(), 2);
}

#[tokio::test]
async fn non_json_content_type_is_rejected() {
    let h = Harness::new();
    let err = h
        .fm
        .process_event("text/plain", "whatever")
        .await
        .unwrap_err();
    assert!(matches!(err, driftwave_flow_core::FlowError::Protocol(_)));
}
