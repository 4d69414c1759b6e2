/// Slot hashing, the slot table and the router on top of it
///
/// The table is an immutable-size array of atomic owner ids behind an
/// `ArcSwap`. A full refresh builds a new table off to the side and swaps
/// it in; a MOVED redirect compare-and-sets a single entry. Readers never
/// take a lock and never see a half-applied update.
use super::redirect::{RedirectParser, RedirectType};
use crate::core::{ClusterNode, NodeId, NodeRegistry};
use crate::error::{GatewayError, GatewayResult};
use crate::utils::{crc16, extract_hash_tag};
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Number of hash slots in a Redis Cluster
pub const SLOT_COUNT: usize = 16384;

const UNASSIGNED: u32 = u32::MAX;

/// An inclusive range of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    pub fn size(&self) -> u16 {
        self.end - self.start + 1
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Slot of a key: CRC16 of the key, or of its hash tag when it has one
pub fn key_slot(key: &[u8], hash_tag: Option<(u8, u8)>) -> u16 {
    let hashed = match hash_tag {
        Some((open, close)) => extract_hash_tag(key, open, close),
        None => key,
    };
    crc16(hashed) % SLOT_COUNT as u16
}

/// Slot to owner mapping
pub struct SlotTable {
    owners: Box<[AtomicU32]>,
}

impl SlotTable {
    pub fn empty() -> Self {
        Self {
            owners: (0..SLOT_COUNT).map(|_| AtomicU32::new(UNASSIGNED)).collect(),
        }
    }

    /// Build a table from owner assignments; later entries win on overlap
    pub fn from_assignments<'a, I>(assignments: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, &'a SlotRange)>,
    {
        let table = Self::empty();
        for (node, range) in assignments {
            for slot in range.start..=range.end.min(SLOT_COUNT as u16 - 1) {
                table.owners[slot as usize].store(node, Ordering::Relaxed);
            }
        }
        table
    }

    pub fn owner(&self, slot: u16) -> Option<NodeId> {
        match self.owners.get(slot as usize)?.load(Ordering::Acquire) {
            UNASSIGNED => None,
            id => Some(id),
        }
    }

    /// Point `slot` at `new` if it still points at `expected`
    fn compare_and_set(&self, slot: u16, expected: Option<NodeId>, new: NodeId) -> bool {
        let Some(entry) = self.owners.get(slot as usize) else {
            return false;
        };
        entry
            .compare_exchange(
                expected.unwrap_or(UNASSIGNED),
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn assigned_count(&self) -> usize {
        self.owners
            .iter()
            .filter(|o| o.load(Ordering::Relaxed) != UNASSIGNED)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.assigned_count() == SLOT_COUNT
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("assigned", &self.assigned_count())
            .finish()
    }
}

/// Where a key goes, as decided from one table snapshot
#[derive(Debug, Clone)]
pub struct Route {
    pub slot: u16,
    pub node: Arc<ClusterNode>,
    /// The table entry this route was read from; `None` means fallback
    pub owner: Option<NodeId>,
}

/// Maps keys to cluster nodes and applies redirects
#[derive(Debug)]
pub struct SlotRouter {
    registry: Arc<NodeRegistry>,
    table: ArcSwap<SlotTable>,
    fallback: Option<Arc<ClusterNode>>,
    hash_tag: Option<(u8, u8)>,
}

impl SlotRouter {
    pub fn new(
        registry: Arc<NodeRegistry>,
        hash_tag: Option<(u8, u8)>,
        fallback: Option<&str>,
    ) -> Self {
        let fallback = fallback.map(|addr| registry.get_or_insert(addr));
        Self {
            registry,
            table: ArcSwap::from_pointee(SlotTable::empty()),
            fallback,
            hash_tag,
        }
    }

    pub fn key_slot(&self, key: &[u8]) -> u16 {
        key_slot(key, self.hash_tag)
    }

    /// Route a key to its node
    pub fn route(&self, key: &[u8]) -> GatewayResult<Route> {
        self.route_slot(self.key_slot(key))
    }

    pub fn route_slot(&self, slot: u16) -> GatewayResult<Route> {
        let table = self.table.load();
        if let Some(owner) = table.owner(slot) {
            if let Some(node) = self.registry.get(owner) {
                return Ok(Route {
                    slot,
                    node,
                    owner: Some(owner),
                });
            }
        }

        match &self.fallback {
            Some(node) => Ok(Route {
                slot,
                node: Arc::clone(node),
                owner: None,
            }),
            None => Err(GatewayError::NoRouteAvailable { slot }),
        }
    }

    /// Apply a redirect and return the node to retry against.
    ///
    /// The target is registered if unknown. MOVED repoints the slot, but
    /// only if it still points where the redirected request was routed;
    /// ASK never touches the table.
    pub fn apply_redirect(
        &self,
        redirect: &RedirectType,
        routed_from: Option<NodeId>,
    ) -> GatewayResult<Arc<ClusterNode>> {
        let address = redirect.address();
        RedirectParser::validate_node_address(address)
            .map_err(|e| GatewayError::desync(e.to_string()))?;

        let node = self.registry.get_or_insert(address);
        let slot = redirect.slot();

        if let RedirectType::Moved { .. } = redirect {
            let table = self.table.load();
            if table.compare_and_set(slot, routed_from, node.id) {
                debug!(slot, node = %node.addr, "Slot moved");
            } else {
                debug!(slot, node = %node.addr, "Slot changed concurrently, keeping newer owner");
            }
        }

        Ok(node)
    }

    /// Replace the whole table from `(address, ranges)` assignments
    pub fn refresh(&self, assignments: &[(String, Vec<SlotRange>)]) {
        let mut owned = Vec::new();
        for (addr, ranges) in assignments {
            let node = self.registry.get_or_insert(addr);
            node.set_slot_ranges(ranges.clone());
            owned.push((node.id, ranges));
        }

        let table = SlotTable::from_assignments(
            owned
                .iter()
                .flat_map(|(id, ranges)| ranges.iter().map(move |r| (*id, r))),
        );
        let assigned = table.assigned_count();
        self.table.store(Arc::new(table));
        info!(
            nodes = assignments.len(),
            assigned, "Slot table refreshed"
        );
    }

    pub fn table(&self) -> Arc<SlotTable> {
        self.table.load_full()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn fallback(&self) -> Option<&Arc<ClusterNode>> {
        self.fallback.as_ref()
    }
}

/// Parse a `CLUSTER NODES` reply into per-master slot ranges.
///
/// Replicas and failed nodes are skipped, as are importing/migrating
/// markers. A master advertising an empty host (`:7000`) is taken to be
/// `queried`, the node that answered.
pub fn parse_cluster_nodes(text: &str, queried: &str) -> Vec<(String, Vec<SlotRange>)> {
    let mut masters = Vec::new();

    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            continue;
        }

        let flags = parts[2];
        if flags.contains("slave") || flags.contains("fail") || !flags.contains("master") {
            continue;
        }

        let address = match parts[1].find('@') {
            Some(at) => &parts[1][..at],
            None => parts[1],
        };
        let address = if address.starts_with(':') {
            queried
        } else {
            address
        };

        let mut ranges = Vec::new();
        for slot_spec in &parts[8..] {
            if slot_spec.starts_with('[') {
                continue;
            }
            let range = match slot_spec.split_once('-') {
                Some((start, end)) => match (start.parse::<u16>(), end.parse::<u16>()) {
                    (Ok(start), Ok(end)) if start <= end => SlotRange::new(start, end),
                    _ => continue,
                },
                None => match slot_spec.parse::<u16>() {
                    Ok(slot) => SlotRange::new(slot, slot),
                    Err(_) => continue,
                },
            };
            if (range.end as usize) < SLOT_COUNT {
                ranges.push(range);
            }
        }

        if !ranges.is_empty() {
            masters.push((address.to_string(), ranges));
        }
    }

    masters
}
