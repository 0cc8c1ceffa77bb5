//! Neighborhood reconciler — applies LBN announcements to the local
//! `Neighbor` table and `NeighborhoodAction` queue.
//!
//! Two operations: [`apply_initial_set`] for the full list fetched after
//! registration, and [`apply_change_batch`] for incremental change
//! notifications. Both run under one transaction holding `NeighborLock`
//! then `NeighborhoodActionLock`, apply items in list order, commit iff
//! any item produced changes, and roll back wholesale on failure.
//!
//! Item-level failures (bad identifier length, out-of-range port, invalid
//! location, full neighborhood) skip the item and continue the batch.
//! An unresolvable contact aborts the whole batch — the LBN replays the
//! delta after reconnect, and re-application is idempotent.
//!
//! [`apply_initial_set`]: NeighborhoodReconciler::apply_initial_set
//! [`apply_change_batch`]: NeighborhoodReconciler::apply_change_batch

use std::net::IpAddr;

use chrono::{Duration, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, error};

use vicinity_core::proto::{
    location_is_valid, ContactError, NeighbourhoodChange, NodeInfo,
};

use crate::db::{DbLock, NeighborhoodStore, NewAction, StoreError, Transaction};
use crate::model::{Neighbor, NeighborhoodActionKind};
use crate::processor::ProcessorSignal;

/// Locks every reconciler transaction holds, in order.
const RECONCILE_LOCKS: &[DbLock] = &[DbLock::Neighbor, DbLock::NeighborhoodAction];

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid node contact: {0}")]
    Contact(#[from] ContactError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Admission limits, taken from configuration at construction.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub max_neighborhood_size: usize,
    pub identifier_length: usize,
}

/// Result of one upsert. `error` marks a skipped invalid item; the batch
/// continues either way and commits based on the aggregate `save_db`.
#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub error: bool,
    pub save_db: bool,
    pub signal: bool,
    /// Neighborhood size after this item, threaded into the next call.
    pub new_size: usize,
}

pub struct NeighborhoodReconciler {
    store: NeighborhoodStore,
    processor: ProcessorSignal,
    settings: ReconcilerSettings,
}

impl NeighborhoodReconciler {
    pub fn new(
        store: NeighborhoodStore,
        processor: ProcessorSignal,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            processor,
            settings,
        }
    }

    pub fn store(&self) -> &NeighborhoodStore {
        &self.store
    }

    /// Apply the full neighborhood list fetched after registration.
    pub async fn apply_initial_set(&self, nodes: &[NodeInfo]) -> Result<(), ReconcileError> {
        let mut tx = self.store.begin(RECONCILE_LOCKS).await;
        let mut size = tx.neighbor_count();
        let mut save_db = false;
        let mut signal = false;

        for node in nodes {
            let outcome = self.upsert_node(&mut tx, node, size)?;
            size = outcome.new_size;
            save_db |= outcome.save_db;
            signal |= outcome.signal;
        }

        if save_db {
            tx.save();
        }
        tx.commit();
        if signal {
            self.processor.signal();
        }
        Ok(())
    }

    /// Apply one ordered batch of incremental changes.
    pub async fn apply_change_batch(
        &self,
        changes: &[NeighbourhoodChange],
    ) -> Result<(), ReconcileError> {
        let mut tx = self.store.begin(RECONCILE_LOCKS).await;
        let mut size = tx.neighbor_count();
        let mut save_db = false;
        let mut signal = false;

        for change in changes {
            match change {
                NeighbourhoodChange::AddedNodeInfo(node)
                | NeighbourhoodChange::UpdatedNodeInfo(node) => {
                    let outcome = self.upsert_node(&mut tx, node, size)?;
                    size = outcome.new_size;
                    save_db |= outcome.save_db;
                    signal |= outcome.signal;
                }
                NeighbourhoodChange::RemovedNodeId(server_id) => {
                    if self.remove_neighbor(&mut tx, server_id) {
                        save_db = true;
                        signal = true;
                    }
                }
            }
        }

        if save_db {
            tx.save();
        }
        tx.commit();
        if signal {
            self.processor.signal();
        }
        Ok(())
    }

    fn upsert_node(
        &self,
        tx: &mut Transaction<'_>,
        node: &NodeInfo,
        current_size: usize,
    ) -> Result<UpsertOutcome, ReconcileError> {
        // Contact resolution failure is batch-fatal, unlike field validation.
        let ip = node.profile.contact.resolve()?;
        Ok(self.add_or_change(
            tx,
            &node.profile.node_id,
            ip,
            node.profile.contact.port,
            node.latitude,
            node.longitude,
            current_size,
        ))
    }

    /// Insert or update one neighbor. Validation failures and a full
    /// neighborhood skip the item without touching state.
    pub fn add_or_change(
        &self,
        tx: &mut Transaction<'_>,
        server_id: &[u8],
        ip: IpAddr,
        port: u32,
        latitude: i32,
        longitude: i32,
        current_size: usize,
    ) -> UpsertOutcome {
        let mut outcome = UpsertOutcome {
            error: false,
            save_db: false,
            signal: false,
            new_size: current_size,
        };

        if server_id.len() != self.settings.identifier_length {
            error!(
                id = %hex::encode(server_id),
                length = server_id.len(),
                "node identifier has invalid length"
            );
            outcome.error = true;
            return outcome;
        }
        if port == 0 || port > u32::from(u16::MAX) {
            error!(id = %short_id(server_id), port, "node port out of range");
            outcome.error = true;
            return outcome;
        }
        let port = port as u16;
        if !location_is_valid(latitude, longitude) {
            error!(
                id = %short_id(server_id),
                latitude,
                longitude,
                "node location is invalid"
            );
            outcome.error = true;
            return outcome;
        }

        match tx.get_neighbor(server_id) {
            None => {
                if current_size >= self.settings.max_neighborhood_size {
                    error!(
                        id = %short_id(server_id),
                        size = current_size,
                        "neighborhood is full, not adding neighbor"
                    );
                    return outcome;
                }

                let inserted = tx.insert_neighbor(Neighbor {
                    neighbor_id: server_id.to_vec(),
                    ip_address: ip,
                    primary_port: port,
                    sr_neighbor_port: None,
                    location_latitude: latitude,
                    location_longitude: longitude,
                    last_refresh_time: None,
                });
                if let Err(e) = inserted {
                    error!(id = %short_id(server_id), error = %e, "neighbor insert failed");
                    outcome.error = true;
                    return outcome;
                }
                outcome.new_size = current_size + 1;

                let now = Utc::now();
                let jitter = rand::thread_rng()
                    .gen_range(0..3 * outcome.new_size as i64);
                tx.insert_action(NewAction {
                    server_id: server_id.to_vec(),
                    kind: NeighborhoodActionKind::AddNeighbor,
                    timestamp: now,
                    execute_after: Some(now + Duration::seconds(jitter)),
                });

                debug!(
                    id = %short_id(server_id),
                    address = %ip,
                    port,
                    size = outcome.new_size,
                    "neighbor added"
                );
                outcome.save_db = true;
                outcome.signal = true;
            }
            Some(mut existing) => {
                if existing.ip_address != ip {
                    existing.ip_address = ip;
                }
                if existing.primary_port != port {
                    existing.primary_port = port;
                    // The old neighbor port is stale until the peer
                    // handshake succeeds against the new primary port.
                    existing.sr_neighbor_port = None;
                }
                if existing.location_latitude != latitude {
                    existing.location_latitude = latitude;
                }
                if existing.location_longitude != longitude {
                    existing.location_longitude = longitude;
                }
                existing.last_refresh_time = Some(Utc::now());

                if let Err(e) = tx.update_neighbor(existing) {
                    error!(id = %short_id(server_id), error = %e, "neighbor update failed");
                    outcome.error = true;
                    return outcome;
                }
                debug!(id = %short_id(server_id), "neighbor refreshed");
                outcome.save_db = true;
            }
        }

        outcome
    }

    /// Queue removal of a neighbor. Returns true if an action was
    /// enqueued. The row itself stays — deleting it is the action
    /// processor's job.
    fn remove_neighbor(&self, tx: &mut Transaction<'_>, server_id: &[u8]) -> bool {
        if server_id.len() != self.settings.identifier_length {
            error!(
                id = %hex::encode(server_id),
                length = server_id.len(),
                "node identifier has invalid length"
            );
            return false;
        }
        if tx.get_neighbor(server_id).is_none() {
            // Stale announcement; the profiles will expire downstream.
            debug!(id = %short_id(server_id), "removal of unknown neighbor ignored");
            return false;
        }
        // A replayed batch must not queue a second removal.
        if tx.has_pending_action(server_id, NeighborhoodActionKind::RemoveNeighbor) {
            debug!(id = %short_id(server_id), "removal already queued");
            return false;
        }

        tx.insert_action(NewAction {
            server_id: server_id.to_vec(),
            kind: NeighborhoodActionKind::RemoveNeighbor,
            timestamp: Utc::now(),
            execute_after: None,
        });
        debug!(id = %short_id(server_id), "neighbor removal queued");
        true
    }
}

fn short_id(id: &[u8]) -> String {
    hex::encode(&id[..4.min(id.len())])
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use vicinity_core::proto::{NodeContact, NodeProfile, NO_LOCATION};

    fn reconciler(max_size: usize) -> (NeighborhoodReconciler, NeighborhoodStore, ProcessorSignal) {
        let store = NeighborhoodStore::new();
        let processor = ProcessorSignal::new();
        let reconciler = NeighborhoodReconciler::new(
            store.clone(),
            processor.clone(),
            ReconcilerSettings {
                max_neighborhood_size: max_size,
                identifier_length: 32,
            },
        );
        (reconciler, store, processor)
    }

    fn node(id: u8, last_octet: u8, port: u32) -> NodeInfo {
        NodeInfo {
            profile: NodeProfile {
                node_id: vec![id; 32],
                contact: NodeContact {
                    kind: vicinity_core::proto::CONTACT_IPV4,
                    addr: vec![1, 1, 1, last_octet],
                    port,
                },
            },
            latitude: 48_000_000,
            longitude: 11_000_000,
        }
    }

    async fn signaled(processor: &ProcessorSignal) -> bool {
        tokio::time::timeout(std::time::Duration::from_millis(20), processor.notified())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn empty_initial_set_commits_nothing() {
        let (reconciler, store, processor) = reconciler(10);
        reconciler.apply_initial_set(&[]).await.unwrap();

        assert_eq!(store.neighbor_count().await, 0);
        assert!(store.actions_snapshot().await.is_empty());
        assert!(!signaled(&processor).await);
    }

    #[tokio::test]
    async fn initial_set_inserts_rows_and_jittered_actions() {
        let (reconciler, store, processor) = reconciler(10);
        let nodes = vec![node(1, 1, 1000), node(2, 2, 1000), node(3, 3, 1000)];
        reconciler.apply_initial_set(&nodes).await.unwrap();

        assert_eq!(store.neighbor_count().await, 3);
        let neighbors = store.neighbors_snapshot().await;
        for n in &neighbors {
            assert!(n.last_refresh_time.is_none());
            assert!(n.sr_neighbor_port.is_none());
        }

        let actions = store.actions_snapshot().await;
        assert_eq!(actions.len(), 3);
        for (i, action) in actions.iter().enumerate() {
            assert_eq!(action.kind, NeighborhoodActionKind::AddNeighbor);
            let after = action.execute_after.expect("add actions carry a delay");
            let delay = after - action.timestamp;
            assert!(delay >= Duration::zero());
            // The i-th insert saw a neighborhood of i+1.
            assert!(delay < Duration::seconds(3 * (i as i64 + 1)));
            assert!(action.target_identity_id.is_none());
            assert!(action.additional_data.is_none());
        }

        assert!(signaled(&processor).await);
        assert!(!signaled(&processor).await, "one commit, one wake-up");
    }

    #[tokio::test]
    async fn capacity_reached_mid_batch_keeps_list_order_prefix() {
        let (reconciler, store, _) = reconciler(2);
        let nodes = vec![node(1, 1, 1000), node(2, 2, 1000), node(3, 3, 1000)];
        reconciler.apply_initial_set(&nodes).await.unwrap();

        let neighbors = store.neighbors_snapshot().await;
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].neighbor_id, vec![1u8; 32]);
        assert_eq!(neighbors[1].neighbor_id, vec![2u8; 32]);
        assert_eq!(store.actions_snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn update_with_new_port_invalidates_neighbor_port() {
        let (reconciler, store, processor) = reconciler(10);
        reconciler.apply_initial_set(&[node(1, 1, 1000)]).await.unwrap();
        assert!(signaled(&processor).await);

        // The peer handshake has since filled in the neighbor port.
        {
            let mut tx = store.begin(&[DbLock::Neighbor]).await;
            let mut n = tx.get_neighbor(&[1u8; 32]).unwrap();
            n.sr_neighbor_port = Some(2000);
            tx.update_neighbor(n).unwrap();
            tx.save();
            tx.commit();
        }

        let changes = vec![NeighbourhoodChange::UpdatedNodeInfo(node(1, 1, 1001))];
        reconciler.apply_change_batch(&changes).await.unwrap();

        let n = &store.neighbors_snapshot().await[0];
        assert_eq!(n.primary_port, 1001);
        assert_eq!(n.sr_neighbor_port, None);
        let refreshed = n.last_refresh_time.expect("update sets refresh time");
        assert!(Utc::now() - refreshed < Duration::seconds(5));

        // Updates enqueue nothing and wake nobody.
        assert_eq!(store.actions_snapshot().await.len(), 1);
        assert!(!signaled(&processor).await);
    }

    #[tokio::test]
    async fn update_keeping_port_keeps_neighbor_port() {
        let (reconciler, store, _) = reconciler(10);
        reconciler.apply_initial_set(&[node(1, 1, 1000)]).await.unwrap();
        {
            let mut tx = store.begin(&[DbLock::Neighbor]).await;
            let mut n = tx.get_neighbor(&[1u8; 32]).unwrap();
            n.sr_neighbor_port = Some(2000);
            tx.update_neighbor(n).unwrap();
            tx.save();
            tx.commit();
        }

        let changes = vec![NeighbourhoodChange::UpdatedNodeInfo(node(1, 7, 1000))];
        reconciler.apply_change_batch(&changes).await.unwrap();

        let n = &store.neighbors_snapshot().await[0];
        assert_eq!(n.ip_address, std::net::IpAddr::from([1, 1, 1, 7]));
        assert_eq!(n.sr_neighbor_port, Some(2000));
    }

    #[tokio::test]
    async fn remove_of_unknown_id_commits_clean() {
        let (reconciler, store, processor) = reconciler(10);
        let changes = vec![NeighbourhoodChange::RemovedNodeId(vec![9u8; 32])];
        reconciler.apply_change_batch(&changes).await.unwrap();

        assert!(store.actions_snapshot().await.is_empty());
        assert!(!signaled(&processor).await);
    }

    #[tokio::test]
    async fn add_then_remove_keeps_row_and_queues_one_removal() {
        let (reconciler, store, _) = reconciler(10);
        reconciler
            .apply_change_batch(&[NeighbourhoodChange::AddedNodeInfo(node(1, 1, 1000))])
            .await
            .unwrap();
        reconciler
            .apply_change_batch(&[NeighbourhoodChange::RemovedNodeId(vec![1u8; 32])])
            .await
            .unwrap();

        // The row survives; deletion belongs to the action processor.
        assert_eq!(store.neighbor_count().await, 1);
        let removals: Vec<_> = store
            .actions_snapshot()
            .await
            .into_iter()
            .filter(|a| a.kind == NeighborhoodActionKind::RemoveNeighbor)
            .collect();
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].execute_after, None);
    }

    #[tokio::test]
    async fn wrong_identifier_length_is_skipped_without_state_change() {
        let (reconciler, store, processor) = reconciler(10);
        let mut bad = node(1, 1, 1000);
        bad.profile.node_id = vec![1u8; 20];
        let changes = vec![
            NeighbourhoodChange::AddedNodeInfo(bad),
            NeighbourhoodChange::RemovedNodeId(vec![2u8; 16]),
        ];
        reconciler.apply_change_batch(&changes).await.unwrap();

        assert_eq!(store.neighbor_count().await, 0);
        assert!(store.actions_snapshot().await.is_empty());
        assert!(!signaled(&processor).await);
    }

    #[tokio::test]
    async fn port_boundaries() {
        let (reconciler, store, _) = reconciler(10);
        let nodes = vec![
            node(1, 1, 0),
            node(2, 2, 65_536),
            node(3, 3, 1),
            node(4, 4, 65_535),
        ];
        reconciler.apply_initial_set(&nodes).await.unwrap();

        let neighbors = store.neighbors_snapshot().await;
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].neighbor_id, vec![3u8; 32]);
        assert_eq!(neighbors[0].primary_port, 1);
        assert_eq!(neighbors[1].primary_port, 65_535);
    }

    #[tokio::test]
    async fn invalid_location_is_skipped() {
        let (reconciler, store, _) = reconciler(10);
        let mut polar = node(1, 1, 1000);
        polar.latitude = 90_000_001;
        let mut sentinel = node(2, 2, 1000);
        sentinel.longitude = NO_LOCATION;
        reconciler.apply_initial_set(&[polar, sentinel]).await.unwrap();

        assert_eq!(store.neighbor_count().await, 0);
    }

    #[tokio::test]
    async fn unresolvable_contact_rolls_back_the_whole_batch() {
        let (reconciler, store, processor) = reconciler(10);
        let mut broken = node(2, 2, 1000);
        broken.profile.contact.kind = 9;
        let changes = vec![
            NeighbourhoodChange::AddedNodeInfo(node(1, 1, 1000)),
            NeighbourhoodChange::AddedNodeInfo(broken),
        ];

        let result = reconciler.apply_change_batch(&changes).await;
        assert!(matches!(result, Err(ReconcileError::Contact(_))));

        // The valid first item must not survive the rollback.
        assert_eq!(store.neighbor_count().await, 0);
        assert!(store.actions_snapshot().await.is_empty());
        assert!(!signaled(&processor).await);
    }

    #[tokio::test]
    async fn reapplying_a_batch_is_idempotent() {
        let (reconciler, store, _) = reconciler(10);
        reconciler.apply_initial_set(&[node(2, 2, 1000)]).await.unwrap();

        let batch = vec![
            NeighbourhoodChange::AddedNodeInfo(node(1, 1, 1000)),
            NeighbourhoodChange::UpdatedNodeInfo(node(2, 2, 1001)),
            NeighbourhoodChange::RemovedNodeId(vec![2u8; 32]),
        ];
        reconciler.apply_change_batch(&batch).await.unwrap();

        let neighbors_once = store.neighbors_snapshot().await;
        let actions_once = store.actions_snapshot().await;

        reconciler.apply_change_batch(&batch).await.unwrap();

        let neighbors_twice = store.neighbors_snapshot().await;
        let actions_twice = store.actions_snapshot().await;

        // Rows identical up to refresh timestamps.
        assert_eq!(neighbors_once.len(), neighbors_twice.len());
        for (a, b) in neighbors_once.iter().zip(&neighbors_twice) {
            assert_eq!(a.neighbor_id, b.neighbor_id);
            assert_eq!(a.ip_address, b.ip_address);
            assert_eq!(a.primary_port, b.primary_port);
            assert_eq!(a.sr_neighbor_port, b.sr_neighbor_port);
            assert_eq!(a.location_latitude, b.location_latitude);
            assert_eq!(a.location_longitude, b.location_longitude);
        }
        let kinds = |actions: &[crate::model::NeighborhoodAction]| {
            actions
                .iter()
                .map(|a| (a.server_id.clone(), a.kind))
                .collect::<Vec<_>>()
        };
        assert_eq!(kinds(&actions_once), kinds(&actions_twice));
    }

    #[tokio::test]
    async fn add_or_change_flags_invalid_items_without_touching_state() {
        let (reconciler, store, _) = reconciler(10);
        let ip: std::net::IpAddr = "1.1.1.1".parse().unwrap();

        let mut tx = store.begin(RECONCILE_LOCKS).await;
        let rejected = reconciler.add_or_change(&mut tx, &[1u8; 16], ip, 1000, 0, 0, 0);
        assert!(rejected.error);
        assert!(!rejected.save_db && !rejected.signal);
        assert_eq!(rejected.new_size, 0);

        let ok = reconciler.add_or_change(&mut tx, &[1u8; 32], ip, 1000, 0, 0, 0);
        assert!(!ok.error);
        assert!(ok.save_db && ok.signal);
        assert_eq!(ok.new_size, 1);
        tx.rollback();

        assert_eq!(store.neighbor_count().await, 0);
    }

    #[tokio::test]
    async fn committed_size_never_exceeds_capacity() {
        let (reconciler, store, _) = reconciler(3);
        for round in 0..4u8 {
            let nodes: Vec<_> = (0..4u8)
                .map(|i| node(round * 4 + i + 1, i + 1, 1000))
                .collect();
            reconciler.apply_initial_set(&nodes).await.unwrap();
            assert!(store.neighbor_count().await <= 3);
        }
        assert_eq!(store.neighbor_count().await, 3);
    }
}
