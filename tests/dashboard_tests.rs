mod test_harness;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use slotd::collector::{Collector, MemoryCollector};
use slotd::dashboard::{router, DashboardState};
use slotd::slot::SlotRecord;
use test_harness::{attrs, test_config, TestStartd};

fn record(name: &str, state: &str, cpus: u32) -> SlotRecord {
    SlotRecord {
        name: name.to_string(),
        public: attrs(json!({
            "Name": name,
            "State": state,
            "Activity": "Idle",
            "Cpus": cpus,
            "Memory": 2048,
            "Draining": false,
        })),
        private: attrs(json!({"Name": name, "ClaimId": "secret-token"})),
    }
}

async fn get(state: DashboardState, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

fn state_with(records: Vec<SlotRecord>) -> DashboardState {
    let collector = MemoryCollector::new();
    for r in records {
        collector.publish(r);
    }
    DashboardState {
        collector: Arc::new(collector),
    }
}

#[tokio::test]
async fn test_slot_list_summarizes_records() {
    let state = state_with(vec![
        record("slot1", "Claimed", 4),
        record("slot2", "Unclaimed", 2),
    ]);

    let (status, body) = get(state, "/api/slots").await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["state"], "Claimed");
    let slots = json["slots"].as_array().unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["name"], "slot1");
    assert_eq!(slots[0]["cpus"], 4.0);
    assert_eq!(slots[1]["state"], "Unclaimed");
    assert_eq!(slots[1]["draining"], false);
}

#[tokio::test]
async fn test_slot_detail_hides_private_record() {
    let state = state_with(vec![record("slot1", "Unclaimed", 1)]);

    let (status, body) = get(state.clone(), "/api/slots/slot1").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["Name"], "slot1");
    assert!(json.get("ClaimId").is_none());
    assert!(!String::from_utf8_lossy(&body).contains("secret-token"));

    let (status, body) = get(state, "/api/slots/slot9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("slot9"));
}

#[tokio::test]
async fn test_empty_collector() {
    let (status, body) = get(state_with(Vec::new()), "/api/slots").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["slots"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_index_page() {
    let (status, body) = get(state_with(Vec::new()), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("/api/slots"));
}

/// The dashboard reads what a live daemon publishes.
#[tokio::test]
async fn test_dashboard_over_running_daemon() {
    let startd = TestStartd::start(test_config(2)).await;
    startd
        .claim_and_run(
            "slot2",
            attrs(json!({"Cmd": "/bin/sleep", "Arguments": "60", "User": "alice@example.org"})),
        )
        .await;

    let state = DashboardState {
        collector: Arc::new(startd.collector.clone()),
    };
    test_harness::assert_eventually(
        || {
            let state = state.clone();
            async move {
                let (_, body) = get(state, "/api/slots/slot2").await;
                let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                json["State"] == "Claimed" && json["Activity"] == "Busy"
            }
        },
        std::time::Duration::from_secs(5),
        "dashboard should show the running claim",
    )
    .await;
}
