//! Key Distribution
//!
//! Splits a bulk key set into one partition per owning server using the
//! client-held distribution map.
//!
//! ```text
//!   keys: [k1 k2 k3 k4 k5]          router.key_owner(k)
//!             │                            │
//!             ▼                            ▼
//!   ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!   │ s1: k1 k4    │ │ s2: k2 k5    │ │ s3: k3       │
//!   └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! Every key lands in exactly one partition. When the map cannot place a
//! key, or an owner is not connected, keys fall back to the load-balanced
//! server and the distribution is marked forced.

use std::collections::BTreeMap;

use crate::domain::messaging::MessageAcks;
use crate::domain::ports::{KeyRouter, ServerAddress};
use crate::error::{Error, Result};

/// View id a command presents to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewIdTag {
    /// The client's last known cluster view
    Client(u64),
    /// Routing fell back; the server must accept the command regardless of
    /// the view it holds
    Forced,
}

impl std::fmt::Display for ViewIdTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewIdTag::Client(id) => write!(f, "view:{}", id),
            ViewIdTag::Forced => write!(f, "view:forced"),
        }
    }
}

/// Keys and their parallel items for one server.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition<T> {
    pub keys: Vec<String>,
    pub items: Vec<T>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            items: Vec::new(),
        }
    }
}

impl<T> Partition<T> {
    fn append(&mut self, mut other: Partition<T>) {
        self.keys.append(&mut other.keys);
        self.items.append(&mut other.items);
    }
}

/// Per-server partitions of a bulk call.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDistribution<T> {
    pub partitions: BTreeMap<ServerAddress, Partition<T>>,
    /// Set when any key was routed away from its owner
    pub forced: bool,
}

impl<T> KeyDistribution<T> {
    /// View id the per-server commands should present.
    pub fn view_tag(&self, client_view: u64) -> ViewIdTag {
        if self.forced {
            ViewIdTag::Forced
        } else {
            ViewIdTag::Client(client_view)
        }
    }

    pub fn server_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn key_count(&self) -> usize {
        self.partitions.values().map(|p| p.keys.len()).sum()
    }
}

/// Partition `keys` (and their parallel `items`) by owning server.
pub fn distribute_keys<T: Clone, R: KeyRouter + ?Sized>(
    router: &R,
    keys: &[String],
    items: Option<&[T]>,
) -> Result<KeyDistribution<T>> {
    if let Some(items) = items {
        if items.len() != keys.len() {
            return Err(Error::LengthMismatch {
                keys: keys.len(),
                items: items.len(),
            });
        }
    }

    let item_at = |i: usize| items.map(|items| items[i].clone());

    let owners: Option<Vec<ServerAddress>> = keys.iter().map(|k| router.key_owner(k)).collect();
    let Some(owners) = owners else {
        // Map cannot place every key: send the whole set to one server.
        let server = router.load_balanced_server().ok_or(Error::NoServerAvailable)?;
        tracing::debug!(
            server = %server,
            keys = keys.len(),
            "Distribution map incomplete, forcing all keys to one server"
        );
        let mut partition = Partition::default();
        for (i, key) in keys.iter().enumerate() {
            partition.keys.push(key.clone());
            partition.items.extend(item_at(i));
        }
        return Ok(KeyDistribution {
            partitions: BTreeMap::from([(server, partition)]),
            forced: true,
        });
    };

    let mut grouped: BTreeMap<ServerAddress, Partition<T>> = BTreeMap::new();
    for (i, (key, owner)) in keys.iter().zip(owners).enumerate() {
        let partition = grouped.entry(owner).or_default();
        partition.keys.push(key.clone());
        partition.items.extend(item_at(i));
    }

    let mut forced = false;
    let disconnected: Vec<ServerAddress> = grouped
        .keys()
        .filter(|s| !router.is_connected(s))
        .cloned()
        .collect();
    if !disconnected.is_empty() {
        let fallback = router.load_balanced_server().ok_or(Error::NoServerAvailable)?;
        for server in disconnected {
            if let Some(partition) = grouped.remove(&server) {
                tracing::debug!(
                    from = %server,
                    to = %fallback,
                    keys = partition.keys.len(),
                    "Owner not connected, rerouting partition"
                );
                grouped.entry(fallback.clone()).or_default().append(partition);
                forced = true;
            }
        }
    }

    Ok(KeyDistribution {
        partitions: grouped,
        forced,
    })
}

/// Partition message acknowledgements by the server owning each topic.
pub fn distribute_messages<R: KeyRouter + ?Sized>(
    router: &R,
    acks: &MessageAcks,
) -> Result<BTreeMap<ServerAddress, MessageAcks>> {
    let mut out: BTreeMap<ServerAddress, MessageAcks> = BTreeMap::new();
    for (topic, ids) in acks {
        let server = match router.key_owner(topic) {
            Some(owner) if router.is_connected(&owner) => owner,
            _ => router.load_balanced_server().ok_or(Error::NoServerAvailable)?,
        };
        out.entry(server)
            .or_default()
            .entry(topic.clone())
            .or_default()
            .extend(ids.iter().cloned());
    }
    Ok(out)
}
