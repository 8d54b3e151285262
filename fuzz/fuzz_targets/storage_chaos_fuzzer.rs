//! Fuzz target for the durable log under storage failures
//!
//! Clients append with dedup tokens and retry every failed append with the
//! same token, the way the submission contract requires. `ChaoticStorage`
//! fails calls outright and also loses acknowledgements of committed appends.
//!
//! # Strategy
//!
//! - Failure and ack-loss rates from 0% to 90%
//! - Appends with fresh tokens, retried tokens and no token
//! - Paged reads from arbitrary offsets
//!
//! # Invariants
//!
//! - Storage NEVER panics on injected errors
//! - Offsets in the inner store are exactly `1..=n`
//! - No token is stored twice, however often it was retried
//! - An append that reported success is readable at its offset
//! - Reads return ascending offsets strictly after the cursor

#![no_main]

use std::collections::HashMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skein_server::{ChaoticStorage, MemoryStorage, Storage, StorageError};

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// 0-9 maps to 0%-90%
    ack_loss_tenth: u8,
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Append under token `token % 16`, retrying up to `retries` times
    Append { token: u8, retries: u8 },
    /// Append without a token
    AppendAnonymous,
    /// Read a page
    Load { after: u8, limit: u8 },
    /// Query the head
    Latest,
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let ack_loss_rate = f64::from(scenario.ack_loss_tenth % 10) / 10.0;

    let inner = MemoryStorage::new();
    let storage = ChaoticStorage::with_seed(inner.clone(), failure_rate, ack_loss_rate, scenario.chaos_seed);

    let mut confirmed: HashMap<u64, String> = HashMap::new();

    for op in scenario.operations {
        match op {
            ChaosOperation::Append { token, retries } => {
                let token = format!("tok-{}", token % 16);
                let content = format!("content for {token}");
                for _ in 0..=(retries % 4) {
                    match storage.append(&content, Some(&token)) {
                        Ok(offset) => {
                            confirmed.insert(offset, content.clone());
                            break;
                        },
                        Err(StorageError::Duplicate { offset, .. }) => {
                            confirmed.insert(offset, content.clone());
                            break;
                        },
                        Err(_) => {},
                    }
                }
            },
            ChaosOperation::AppendAnonymous => {
                if let Ok(offset) = storage.append("anonymous", None) {
                    confirmed.insert(offset, "anonymous".to_string());
                }
            },
            ChaosOperation::Load { after, limit } => {
                let after = u64::from(after);
                if let Ok(records) = storage.load_after(after, usize::from(limit)) {
                    assert!(records.len() <= usize::from(limit));
                    let mut cursor = after;
                    for record in records {
                        assert!(record.offset > cursor, "offset {} not after {cursor}", record.offset);
                        cursor = record.offset;
                    }
                }
            },
            ChaosOperation::Latest => {
                let _ = storage.latest_offset();
            },
        }
    }

    let records = inner.messages();
    let mut tokens = std::collections::HashSet::new();
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.offset, i as u64 + 1, "gap or reorder at position {i}");
        if let Some(token) = &record.dedup_token {
            assert!(tokens.insert(token.clone()), "token {token} stored twice");
        }
    }
    for (offset, content) in confirmed {
        let record = &records[(offset - 1) as usize];
        assert_eq!(&record.content, &content, "confirmed offset {offset} holds other content");
    }
});
