//! Scripted scenarios over the simulated cluster.

use std::time::Duration;

use skein_client::DEFAULT_ACK_TIMEOUT;
use skein_harness::{ClusterConfig, SimCluster, WorkKind, check_safety, connected_clients_caught_up};
use skein_proto::ErrorPayload;
use skein_server::DriverConfig;

const QUIET: usize = 10_000;

fn cluster(workers: usize, clients: usize) -> SimCluster {
    SimCluster::new(ClusterConfig { workers, clients, ..ClusterConfig::default() })
}

fn assert_safe(cluster: &SimCluster) {
    let violations = check_safety(cluster);
    assert!(violations.is_empty(), "violations: {violations:#?}");
}

fn offsets(delivered: &[(String, u64)]) -> Vec<u64> {
    delivered.iter().map(|(_, offset)| *offset).collect()
}

#[test]
fn resubmission_after_lost_ack_is_stored_and_broadcast_once() {
    let mut cluster = cluster(1, 2);
    cluster.connect(0, 0);
    cluster.connect(1, 0);
    cluster.run_until_quiet(QUIET);

    cluster.send(0, "hello");
    assert!(cluster.step_through(WorkKind::Append));
    assert_eq!(cluster.log().len(), 1);

    // Fan-out and ack for client 0 are still queued; the connection drops.
    cluster.disconnect(0);
    cluster.run_until_quiet(QUIET);
    assert_eq!(cluster.client(0).client.pending_count(), 1);

    cluster.connect(0, 0);
    cluster.run_until_quiet(QUIET);

    assert_eq!(cluster.log().len(), 1);
    assert_eq!(cluster.client(0).client.pending_count(), 0);
    assert_eq!(cluster.client(0).observed.acked.len(), 1);
    assert_eq!(cluster.client(0).observed.delivered, vec![("hello".to_string(), 1)]);
    assert_eq!(cluster.client(1).observed.delivered, vec![("hello".to_string(), 1)]);
    assert_safe(&cluster);
}

fn recovery_scenario(driver: DriverConfig) -> (SimCluster, usize) {
    let mut cluster =
        SimCluster::new(ClusterConfig { workers: 1, clients: 2, driver, ..ClusterConfig::default() });
    cluster.connect(0, 0);
    cluster.connect(1, 0);
    for i in 1..=5 {
        cluster.send(1, &format!("m{i}"));
        cluster.run_until_quiet(QUIET);
    }
    assert_eq!(cluster.client(0).client.seen().watermark(), 5);

    cluster.disconnect(0);
    for i in 6..=8 {
        cluster.send(1, &format!("m{i}"));
        cluster.run_until_quiet(QUIET);
    }

    let before = cluster.client(0).observed.delivered.len();
    cluster.connect(0, 0);
    cluster.send(1, "m9");
    cluster.run_until_quiet(QUIET);
    (cluster, before)
}

#[test]
fn replay_delivers_missed_messages_before_new_ones() {
    let driver = DriverConfig { recovery_window: Duration::ZERO, ..DriverConfig::default() };
    let (cluster, before) = recovery_scenario(driver);

    let client = cluster.client(0);
    assert_eq!(offsets(&client.observed.delivered[before..]), vec![6, 7, 8, 9]);
    assert_eq!(client.observed.welcomes.last(), Some(&(0, false)));
    assert_safe(&cluster);
}

#[test]
fn resumed_session_delivers_buffered_messages_without_replay() {
    let (cluster, before) = recovery_scenario(DriverConfig::default());

    let client = cluster.client(0);
    assert_eq!(offsets(&client.observed.delivered[before..]), vec![6, 7, 8, 9]);
    assert_eq!(client.observed.welcomes.last(), Some(&(0, true)));
    assert_safe(&cluster);
}

#[test]
fn messages_appended_offline_are_replayed() {
    let mut cluster = cluster(1, 1);
    for i in 1..=10 {
        cluster.append_offline(&format!("old {i}"));
    }

    cluster.connect(0, 0);
    cluster.run_until_quiet(QUIET);

    assert_eq!(offsets(&cluster.client(0).observed.delivered), (1..=10).collect::<Vec<_>>());
    assert!(connected_clients_caught_up(&cluster).is_empty());
}

#[test]
fn join_notice_reaches_only_same_worker_peers() {
    let mut cluster = cluster(2, 3);
    cluster.connect(0, 0);
    cluster.run_until_quiet(QUIET);
    cluster.connect(1, 1);
    cluster.run_until_quiet(QUIET);
    cluster.connect(2, 0);
    cluster.run_until_quiet(QUIET);

    assert_eq!(cluster.client(0).observed.notices.len(), 1);
    assert!(cluster.client(1).observed.notices.is_empty());
    assert!(cluster.client(2).observed.notices.is_empty());
    assert_eq!(cluster.client(1).observed.welcomes, vec![(1, false)]);
    assert_safe(&cluster);
}

#[test]
fn chat_messages_reach_every_worker() {
    let mut cluster = cluster(3, 3);
    for client in 0..3 {
        cluster.connect(client, client);
    }
    cluster.run_until_quiet(QUIET);

    cluster.send(2, "everyone");
    cluster.run_until_quiet(QUIET);

    for client in 0..3 {
        assert_eq!(cluster.client(client).observed.delivered, vec![("everyone".to_string(), 1)]);
    }
    assert_safe(&cluster);
}

#[test]
fn failed_append_is_retried_until_stored() {
    let mut cluster = SimCluster::new(ClusterConfig {
        workers: 1,
        clients: 2,
        failure_rate: 1.0,
        ..ClusterConfig::default()
    });
    cluster.set_chaos(false);
    cluster.connect(0, 0);
    cluster.connect(1, 0);
    cluster.run_until_quiet(QUIET);

    cluster.set_chaos(true);
    cluster.send(0, "persist me");
    cluster.run_until_quiet(QUIET);
    assert!(cluster.log().is_empty());
    assert!(cluster.client(0).observed.acked.is_empty());

    cluster.set_chaos(false);
    cluster.advance(DEFAULT_ACK_TIMEOUT);
    cluster.run_until_quiet(QUIET);

    assert_eq!(cluster.log().len(), 1);
    assert_eq!(cluster.client(0).observed.acked.len(), 1);
    assert_eq!(cluster.client(1).observed.delivered, vec![("persist me".to_string(), 1)]);
    assert_safe(&cluster);
}

#[test]
fn lost_commit_ack_does_not_duplicate_on_retry() {
    let mut cluster = SimCluster::new(ClusterConfig {
        workers: 1,
        clients: 1,
        ack_loss_rate: 1.0,
        ..ClusterConfig::default()
    });
    cluster.set_chaos(false);
    cluster.connect(0, 0);
    cluster.run_until_quiet(QUIET);

    cluster.set_chaos(true);
    cluster.send(0, "once");
    cluster.run_until_quiet(QUIET);
    assert_eq!(cluster.log().len(), 1);
    assert!(cluster.client(0).observed.acked.is_empty());

    // Still losing acks: the retry hits the dedup check, which acknowledges.
    cluster.advance(DEFAULT_ACK_TIMEOUT);
    cluster.run_until_quiet(QUIET);

    assert_eq!(cluster.log().len(), 1);
    assert_eq!(cluster.client(0).observed.acked.len(), 1);
    assert_safe(&cluster);
}

#[test]
fn retries_run_out_and_message_is_unsent() {
    let mut cluster = SimCluster::new(ClusterConfig {
        workers: 1,
        clients: 1,
        failure_rate: 1.0,
        ..ClusterConfig::default()
    });
    cluster.set_chaos(false);
    cluster.connect(0, 0);
    cluster.run_until_quiet(QUIET);

    cluster.set_chaos(true);
    cluster.send(0, "doomed");
    for _ in 0..=skein_client::DEFAULT_RETRIES {
        cluster.run_until_quiet(QUIET);
        cluster.advance(DEFAULT_ACK_TIMEOUT);
    }
    cluster.run_until_quiet(QUIET);

    assert_eq!(cluster.client(0).observed.unsent.len(), 1);
    assert_eq!(cluster.client(0).client.pending_count(), 0);
    assert!(cluster.log().is_empty());
}

#[test]
fn failed_replay_is_reported_to_client() {
    let mut cluster = SimCluster::new(ClusterConfig {
        workers: 1,
        clients: 1,
        failure_rate: 1.0,
        ..ClusterConfig::default()
    });
    cluster.append_offline("before");

    cluster.connect(0, 0);
    cluster.run_until_quiet(QUIET);

    let observed = &cluster.client(0).observed;
    assert_eq!(observed.incomplete, 1);
    assert!(observed.delivered.is_empty());
    assert!(cluster.client(0).connection.is_some());
}

#[test]
fn over_capacity_worker_rejects_connection() {
    let driver = DriverConfig { max_connections: 1, ..DriverConfig::default() };
    let mut cluster =
        SimCluster::new(ClusterConfig { workers: 1, clients: 2, driver, ..ClusterConfig::default() });
    cluster.connect(0, 0);
    cluster.run_until_quiet(QUIET);
    cluster.connect(1, 0);
    cluster.run_until_quiet(QUIET);

    assert_eq!(cluster.client(1).observed.errors, vec![ErrorPayload::OVERLOADED]);
    assert!(cluster.client(1).connection.is_none());
    assert!(cluster.client(0).connection.is_some());
}
