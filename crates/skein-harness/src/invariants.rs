//! Whole-run invariants.
//!
//! Each check looks at the final log and at what every client observed and
//! reports violations instead of panicking, so a property test can print all
//! of them for a failing seed.

use std::collections::{BTreeMap, BTreeSet};

use skein_server::storage::StoredMessage;

use crate::SimCluster;

/// One broken invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Invariant name
    pub invariant: &'static str,
    /// What went wrong
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

fn violation(invariant: &'static str, message: String) -> Violation {
    Violation { invariant, message }
}

/// Offsets are `1..=n` with no gap or repeat, and no token is stored twice.
pub fn log_is_gap_free(log: &[StoredMessage]) -> Vec<Violation> {
    let mut found = Vec::new();
    for (i, record) in log.iter().enumerate() {
        let expected = i as u64 + 1;
        if record.offset != expected {
            found.push(violation("log_is_gap_free", format!("offset {} at position {expected}", record.offset)));
        }
    }

    let mut tokens = BTreeSet::new();
    for token in log.iter().filter_map(|r| r.dedup_token.as_deref()) {
        if !tokens.insert(token) {
            found.push(violation("log_is_gap_free", format!("token {token} stored twice")));
        }
    }
    found
}

/// Every delivered message matches the log at its offset and no client
/// rendered an offset twice.
pub fn deliveries_match_log(cluster: &SimCluster) -> Vec<Violation> {
    let records = cluster.log();
    let log: BTreeMap<u64, &str> = records.iter().map(|r| (r.offset, r.content.as_str())).collect();
    let mut found = Vec::new();

    for (index, client) in cluster.clients().iter().enumerate() {
        let mut offsets = BTreeSet::new();
        for (content, offset) in &client.observed.delivered {
            if !offsets.insert(*offset) {
                found.push(violation("deliveries_match_log", format!("client {index} got offset {offset} twice")));
            }
            match log.get(offset) {
                Some(stored) if *stored == content => {},
                Some(stored) => found.push(violation(
                    "deliveries_match_log",
                    format!("client {index} got {content:?} at {offset}, log has {stored:?}"),
                )),
                None => found.push(violation(
                    "deliveries_match_log",
                    format!("client {index} got offset {offset} which is not in the log"),
                )),
            }
        }
    }
    found
}

/// Every acknowledged submission is in the log exactly once, with the
/// content that was submitted under its token.
pub fn acked_is_stored_once(cluster: &SimCluster) -> Vec<Violation> {
    let log = cluster.log();
    let mut found = Vec::new();

    for (index, client) in cluster.clients().iter().enumerate() {
        for token in &client.observed.acked {
            let stored: Vec<&StoredMessage> =
                log.iter().filter(|r| r.dedup_token.as_deref() == Some(token.as_str())).collect();
            if stored.len() != 1 {
                found.push(violation(
                    "acked_is_stored_once",
                    format!("client {index} token {token} stored {} times", stored.len()),
                ));
                continue;
            }
            if client.observed.submitted.get(token) != Some(&stored[0].content) {
                found.push(violation("acked_is_stored_once", format!("client {index} token {token} content differs")));
            }
        }
    }
    found
}

/// Join notices never cross workers.
pub fn notices_stay_local(cluster: &SimCluster) -> Vec<Violation> {
    let mut found = Vec::new();
    for (index, client) in cluster.clients().iter().enumerate() {
        for (worker, text) in &client.observed.notices {
            if !text.ends_with(&format!("worker {worker}")) {
                found.push(violation(
                    "notices_stay_local",
                    format!("client {index} on worker {worker} got notice {text:?}"),
                ));
            }
        }
    }
    found
}

/// `Welcome` is the first frame on every connection.
pub fn welcome_comes_first(cluster: &SimCluster) -> Vec<Violation> {
    cluster
        .clients()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.observed.welcome_not_first > 0)
        .map(|(index, c)| {
            violation(
                "welcome_comes_first",
                format!("client {index}: {} connections started without Welcome", c.observed.welcome_not_first),
            )
        })
        .collect()
}

/// Every connected client has seen the whole log.
///
/// Only meaningful once the cluster is quiet and faults are off.
pub fn connected_clients_caught_up(cluster: &SimCluster) -> Vec<Violation> {
    let head = cluster.head();
    cluster
        .clients()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.connection.is_some())
        .filter(|(_, c)| c.client.seen().watermark() != head)
        .map(|(index, c)| {
            violation(
                "connected_clients_caught_up",
                format!("client {index} at {} but log head is {head}", c.client.seen().watermark()),
            )
        })
        .collect()
}

/// All safety invariants (the ones that hold at any point of a run).
pub fn check_safety(cluster: &SimCluster) -> Vec<Violation> {
    let mut found = log_is_gap_free(&cluster.log());
    found.extend(deliveries_match_log(cluster));
    found.extend(acked_is_stored_once(cluster));
    found.extend(notices_stay_local(cluster));
    found.extend(welcome_comes_first(cluster));
    found
}
