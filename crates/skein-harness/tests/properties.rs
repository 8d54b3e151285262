//! Property tests over random cluster histories.
//!
//! A history is a random mix of connects, disconnects, submissions, partial
//! queue processing and clock jumps, run against a cluster whose storage
//! randomly fails and loses acknowledgements. Safety invariants must hold at
//! the end of every history; after faults stop and every client reconnects
//! past the recovery window, every client must have the whole log.

use std::time::Duration;

use proptest::prelude::*;
use skein_client::DEFAULT_ACK_TIMEOUT;
use skein_harness::{ClusterConfig, SimCluster, check_safety, connected_clients_caught_up};
use skein_server::DEFAULT_RECOVERY_WINDOW;

const WORKERS: usize = 3;
const CLIENTS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Connect { client: usize, worker: usize },
    Disconnect { client: usize },
    Send { client: usize },
    Step { count: usize },
    Advance { secs: u64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (0..CLIENTS, 0..WORKERS).prop_map(|(client, worker)| Op::Connect { client, worker }),
        1 => (0..CLIENTS).prop_map(|client| Op::Disconnect { client }),
        4 => (0..CLIENTS).prop_map(|client| Op::Send { client }),
        4 => (1..40usize).prop_map(|count| Op::Step { count }),
        1 => (1..15u64).prop_map(|secs| Op::Advance { secs }),
    ]
}

fn apply(cluster: &mut SimCluster, ops: &[Op]) {
    for (i, op) in ops.iter().enumerate() {
        match *op {
            Op::Connect { client, worker } => cluster.connect(client, worker),
            Op::Disconnect { client } => cluster.disconnect(client),
            Op::Send { client } => cluster.send(client, &format!("message {i} from {client}")),
            Op::Step { count } => {
                for _ in 0..count {
                    cluster.step();
                }
            },
            Op::Advance { secs } => cluster.advance(Duration::from_secs(secs)),
        }
    }
}

/// Stop faults, let parked sessions expire, reconnect everyone and drain
/// outstanding retries.
fn settle(cluster: &mut SimCluster) {
    cluster.set_chaos(false);
    cluster.run_until_quiet(100_000);
    for client in 0..CLIENTS {
        cluster.disconnect(client);
    }
    cluster.advance(DEFAULT_RECOVERY_WINDOW + Duration::from_secs(1));

    for client in 0..CLIENTS {
        cluster.connect(client, client % WORKERS);
    }
    cluster.run_until_quiet(100_000);
    for _ in 0..5 {
        cluster.advance(DEFAULT_ACK_TIMEOUT);
        cluster.run_until_quiet(100_000);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn safety_holds_under_storage_faults(
        seed in any::<u64>(),
        failure_rate in prop_oneof![Just(0.0), Just(0.1), Just(0.3)],
        ack_loss_rate in prop_oneof![Just(0.0), Just(0.2)],
        ops in prop::collection::vec(op(), 1..80),
    ) {
        let mut cluster = SimCluster::new(ClusterConfig {
            workers: WORKERS,
            clients: CLIENTS,
            seed,
            failure_rate,
            ack_loss_rate,
            ..ClusterConfig::default()
        });

        apply(&mut cluster, &ops);
        let violations = check_safety(&cluster);
        prop_assert!(violations.is_empty(), "mid-run: {violations:#?}");

        settle(&mut cluster);
        let mut violations = check_safety(&cluster);
        violations.extend(connected_clients_caught_up(&cluster));
        prop_assert!(violations.is_empty(), "settled: {violations:#?}");
    }

    #[test]
    fn fault_free_submissions_are_all_acknowledged(
        seed in any::<u64>(),
        sends in prop::collection::vec((0..CLIENTS, any::<bool>()), 1..40),
    ) {
        let mut cluster = SimCluster::new(ClusterConfig {
            workers: WORKERS,
            clients: CLIENTS,
            seed,
            ..ClusterConfig::default()
        });
        for client in 0..CLIENTS {
            cluster.connect(client, client % WORKERS);
        }

        for (i, (client, drain)) in sends.iter().enumerate() {
            cluster.send(*client, &format!("m{i}"));
            if *drain {
                cluster.run_until_quiet(100_000);
            }
        }
        cluster.run_until_quiet(100_000);

        // ORACLE: every send stored once, acked once, seen by everyone
        prop_assert_eq!(cluster.log().len(), sends.len());
        let acked: usize = cluster.clients().iter().map(|c| c.observed.acked.len()).sum();
        prop_assert_eq!(acked, sends.len());
        for client in cluster.clients() {
            prop_assert_eq!(client.observed.delivered.len(), sends.len());
        }
        prop_assert!(connected_clients_caught_up(&cluster).is_empty());
        prop_assert!(check_safety(&cluster).is_empty());
    }
}
