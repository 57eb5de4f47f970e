mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use slotd::collector::Collector;
use slotd::command::CommandReply;
use slotd::config::{SlotConfig, StartdConfig};
use slotd::negotiator::{NegotiationClient, NegotiatorConfig};
use slotd::slot::State;
use test_harness::{assert_eventually, attrs, fast_timing, test_config, TestStartd};

fn negotiator(startd: &TestStartd) -> Arc<NegotiationClient> {
    Arc::new(NegotiationClient::new(
        NegotiatorConfig {
            addr: "schedd@submit:9618".into(),
            user: "alice@example.org".into(),
            ..NegotiatorConfig::default()
        },
        startd.handle.clone(),
        Arc::new(startd.collector.clone()),
        startd.policy.clone(),
    ))
}

fn job(extra: serde_json::Value) -> slotd::policy::Attributes {
    let mut job = attrs(json!({"Cmd": "/bin/sleep", "Arguments": "600", "Owner": "alice"}));
    job.extend(attrs(extra));
    job
}

/// Matched jobs are claimed and run; releasing one frees its slot.
#[tokio::test]
async fn test_negotiator_runs_and_releases_jobs() {
    let startd = TestStartd::start(test_config(2)).await;
    let client = negotiator(&startd);

    let first = client.run_job(job(json!({}))).await.unwrap();
    assert_eventually(
        || async {
            startd.collector.get(&first.slot).and_then(|r| r.state()) == Some(State::Claimed)
        },
        Duration::from_secs(5),
        "the claimed slot should be published as Claimed",
    )
    .await;

    let second = client.run_job(job(json!({}))).await.unwrap();
    assert_ne!(first.slot, second.slot, "the second job needs the other slot");
    assert_eq!(startd.starter.spawned().len(), 2);
    assert_eq!(client.leases().await.len(), 2);
    assert_eq!(client.renew_all().await, 2);

    let reply = client.release(&first).await.unwrap();
    assert!(matches!(reply, CommandReply::Finished { .. }));
    assert_eq!(client.leases().await.len(), 1);
    assert!(
        startd
            .wait_for_state(&first.slot, State::Unclaimed, Duration::from_secs(5))
            .await
    );
}

/// A job nobody can satisfy finds no offer.
#[tokio::test]
async fn test_unmatchable_job_is_not_claimed() {
    let startd = TestStartd::start(test_config(1)).await;
    let client = negotiator(&startd);

    let err = client
        .run_job(job(json!({"Requirements": "TARGET.Memory > 1000000"})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("requirements failed"), "{}", err);
    assert!(client.leases().await.is_empty());
    assert!(startd.starter.spawned().is_empty());
}

/// Requests against a partitionable slot are carved into dynamic slots.
#[tokio::test]
async fn test_negotiator_splits_partitionable_slot() {
    let config = StartdConfig {
        slots: vec![SlotConfig::partitionable("slot1", 4, 8192)],
        timing: fast_timing(),
        ..StartdConfig::default()
    };
    let startd = TestStartd::start(config).await;
    let client = negotiator(&startd);

    let first = client
        .run_job(job(json!({"RequestCpus": 2, "RequestMemory": 2048})))
        .await
        .unwrap();
    assert_eq!(first.slot, "slot1_1");
    assert_eventually(
        || async { startd.collector.get("slot1_1").is_some() },
        Duration::from_secs(5),
        "the dynamic slot should be published",
    )
    .await;
    let parent = startd.collector.get("slot1").unwrap();
    assert_eq!(parent.number("Cpus"), Some(2.0));
    assert_eq!(parent.number("Memory"), Some(6144.0));

    let second = client
        .run_job(job(json!({"RequestCpus": 2, "RequestMemory": 2048})))
        .await
        .unwrap();
    assert_eq!(second.slot, "slot1_2");

    // Nothing is left for a third
    assert_eventually(
        || async { startd.collector.get("slot1").and_then(|r| r.number("Cpus")) == Some(0.0) },
        Duration::from_secs(5),
        "the parent should be published with no cpus left",
    )
    .await;
    assert!(client
        .run_job(job(json!({"RequestCpus": 1})))
        .await
        .is_err());

    client.release(&first).await.unwrap();
    assert_eventually(
        || async { startd.collector.get("slot1_1").is_none() },
        Duration::from_secs(5),
        "the released dynamic slot should be withdrawn",
    )
    .await;
    assert_eventually(
        || async { startd.collector.get("slot1").and_then(|r| r.number("Cpus")) == Some(2.0) },
        Duration::from_secs(5),
        "its resources should return to the parent",
    )
    .await;
}

/// A claim the daemon takes away is dropped from the client's leases.
#[tokio::test]
async fn test_vacate_notice_drops_lease() {
    let startd = TestStartd::start(test_config(1)).await;
    let client = negotiator(&startd);
    let inbox = startd.peers.register(client.config().addr.clone()).await;
    client.serve_inbox(inbox);

    client.run_job(job(json!({}))).await.unwrap();
    assert_eq!(client.leases().await.len(), 1);

    let reply = startd
        .send(slotd::command::StartdCommand::VacateAllFast)
        .await;
    assert!(reply.is_ok());

    assert_eventually(
        || async { client.leases().await.is_empty() },
        Duration::from_secs(5),
        "the vacate notice should remove the lease",
    )
    .await;
    assert_eq!(client.renew_all().await, 0);
}
