//! Property-Based Tests for Routing
//!
//! # Test Properties
//!
//! 1. **Partition Cover**: every key lands in exactly one server partition,
//!    whatever the distribution map and connection state
//! 2. **Dedicated Window**: after a state-transfer fault every call inside
//!    the window routes dedicated; the first call past it routes pooled

#![cfg(test)]

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use super::distribution::distribute_keys;
use super::latch::{CallRoute, DedicatedCallLatch};
use crate::domain::ports::{KeyRouter, ManualClock, ServerAddress};

// =============================================================================
// Fixtures
// =============================================================================

/// Router backed by an explicit slot table.
#[derive(Debug)]
struct TableRouter {
    slots: Vec<Option<usize>>,
    servers: usize,
    down: HashSet<usize>,
}

impl TableRouter {
    fn server(i: usize) -> ServerAddress {
        ServerAddress::new(format!("10.0.0.{}:9800", i))
    }
}

impl KeyRouter for TableRouter {
    fn key_owner(&self, key: &str) -> Option<ServerAddress> {
        let hash = key.bytes().fold(17usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
        self.slots[hash % self.slots.len()].map(Self::server)
    }

    fn is_connected(&self, server: &ServerAddress) -> bool {
        !(0..self.servers).any(|i| self.down.contains(&i) && &Self::server(i) == server)
    }

    fn load_balanced_server(&self) -> Option<ServerAddress> {
        (0..self.servers)
            .find(|i| !self.down.contains(i))
            .map(Self::server)
    }
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Slot table over 1-5 servers; `None` slots model a stale map.
fn router_strategy() -> impl Strategy<Value = TableRouter> {
    (1usize..=5).prop_flat_map(|servers| {
        (
            prop::collection::vec(prop::option::weighted(0.95, 0..servers), 1..32),
            prop::collection::hash_set(0..servers, 0..servers),
        )
            .prop_map(move |(slots, down)| TableRouter {
                slots,
                servers,
                down,
            })
    })
}

fn keys_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z]{1,8}:[0-9]{1,4}", 1..64)
        .prop_map(|keys| keys.into_iter().collect())
}

// =============================================================================
// Partition Cover
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_partitions_cover_keys_exactly_once(router in router_strategy(), keys in keys_strategy()) {
        // at least one server must be reachable for any routing to exist
        prop_assume!(router.load_balanced_server().is_some());

        let items: Vec<usize> = (0..keys.len()).collect();
        let dist = distribute_keys(&router, &keys, Some(items.as_slice())).unwrap();

        let mut seen = BTreeSet::new();
        for partition in dist.partitions.values() {
            prop_assert_eq!(partition.keys.len(), partition.items.len());
            for (key, item) in partition.keys.iter().zip(&partition.items) {
                prop_assert!(seen.insert(key.clone()), "key {} in two partitions", key);
                prop_assert_eq!(key, &keys[*item]);
            }
        }
        let expected: BTreeSet<String> = keys.iter().cloned().collect();
        prop_assert_eq!(seen, expected);

        for server in dist.partitions.keys() {
            prop_assert!(router.is_connected(server));
        }
    }
}

// =============================================================================
// Dedicated Window
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_dedicated_window_is_sticky(steps in prop::collection::vec(0u64..20_000, 1..20)) {
        let clock = Arc::new(ManualClock::new());
        let latch = DedicatedCallLatch::new(clock.clone(), Duration::from_secs(60));
        latch.engage();

        let mut elapsed = 0u64;
        let mut expired = false;
        for step in steps {
            clock.advance(Duration::from_millis(step));
            elapsed += step;
            let route = latch.route();
            if expired || elapsed > 60_000 {
                expired = true;
                prop_assert_eq!(route, CallRoute::Pooled);
            } else {
                prop_assert_eq!(route, CallRoute::Dedicated);
            }
        }
    }
}
