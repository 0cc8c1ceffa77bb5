//! Neighborhood store — the `Neighbor` table and `NeighborhoodAction`
//! queue behind named locks and an all-or-nothing unit of work.
//!
//! Each named lock guards its table. A [`Transaction`] acquires the locks
//! it is given (order is fixed: `Neighbor` before `NeighborhoodAction`,
//! asserted at acquisition), stages every mutation on a working copy, and
//! publishes the copy back through the held guards on [`Transaction::commit`]
//! — but only if [`Transaction::save`] was called first. Dropping a
//! transaction without committing discards the working copies; nothing
//! shared changes. Other components of the profile server share these
//! locks, so the acquisition order must hold everywhere.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::model::{Neighbor, NeighborhoodAction, NeighborhoodActionKind};

/// Named database locks, in their fixed acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DbLock {
    Neighbor,
    NeighborhoodAction,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("neighbor {} already exists", hex::encode(.0))]
    DuplicateNeighbor(Vec<u8>),
    #[error("neighbor {} not found", hex::encode(.0))]
    UnknownNeighbor(Vec<u8>),
}

#[derive(Debug, Default, Clone)]
struct NeighborTable {
    rows: HashMap<Vec<u8>, Neighbor>,
}

#[derive(Debug, Default, Clone)]
struct ActionTable {
    rows: Vec<NeighborhoodAction>,
    next_id: u64,
}

struct StoreInner {
    neighbors: Mutex<NeighborTable>,
    actions: Mutex<ActionTable>,
}

/// Shared handle to the neighborhood tables.
#[derive(Clone)]
pub struct NeighborhoodStore {
    inner: Arc<StoreInner>,
}

impl NeighborhoodStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                neighbors: Mutex::new(NeighborTable::default()),
                actions: Mutex::new(ActionTable::default()),
            }),
        }
    }

    /// Begin a transaction holding the given locks.
    ///
    /// `locks` must be in the fixed acquisition order (ascending); this
    /// is asserted so tests catch out-of-order callers. Lock waits are
    /// ordinary awaits and cancel cleanly if the caller is dropped.
    pub async fn begin(&self, locks: &[DbLock]) -> Transaction<'_> {
        debug_assert!(
            locks.windows(2).all(|pair| pair[0] < pair[1]),
            "database locks must be acquired in fixed order: {locks:?}"
        );

        let mut tx = Transaction {
            neighbors: None,
            actions: None,
            dirty: false,
        };
        for lock in locks {
            match lock {
                DbLock::Neighbor => {
                    let guard = self.inner.neighbors.lock().await;
                    let working = guard.clone();
                    tx.neighbors = Some(TableTx { guard, working });
                }
                DbLock::NeighborhoodAction => {
                    let guard = self.inner.actions.lock().await;
                    let working = guard.clone();
                    tx.actions = Some(TableTx { guard, working });
                }
            }
        }
        tx
    }

    /// Committed neighbor count, for status surfaces.
    pub async fn neighbor_count(&self) -> usize {
        self.inner.neighbors.lock().await.rows.len()
    }

    /// Snapshot of all committed neighbors.
    pub async fn neighbors_snapshot(&self) -> Vec<Neighbor> {
        let mut rows: Vec<_> = self.inner.neighbors.lock().await.rows.values().cloned().collect();
        rows.sort_by(|a, b| a.neighbor_id.cmp(&b.neighbor_id));
        rows
    }

    /// Snapshot of all pending actions, in insertion order.
    pub async fn actions_snapshot(&self) -> Vec<NeighborhoodAction> {
        self.inner.actions.lock().await.rows.clone()
    }
}

impl Default for NeighborhoodStore {
    fn default() -> Self {
        Self::new()
    }
}

struct TableTx<'a, T> {
    guard: MutexGuard<'a, T>,
    working: T,
}

/// Fields for a new action; the store assigns the queue id.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub server_id: Vec<u8>,
    pub kind: NeighborhoodActionKind,
    pub timestamp: DateTime<Utc>,
    pub execute_after: Option<DateTime<Utc>>,
}

/// An open unit of work. All reads and writes go through the working
/// copies; nothing is visible to other tasks until `commit`.
pub struct Transaction<'a> {
    neighbors: Option<TableTx<'a, NeighborTable>>,
    actions: Option<TableTx<'a, ActionTable>>,
    dirty: bool,
}

impl Transaction<'_> {
    fn neighbor_tx(&self) -> &NeighborTable {
        match &self.neighbors {
            Some(tx) => &tx.working,
            None => panic!("transaction does not hold the Neighbor lock"),
        }
    }

    fn neighbor_tx_mut(&mut self) -> &mut NeighborTable {
        match &mut self.neighbors {
            Some(tx) => &mut tx.working,
            None => panic!("transaction does not hold the Neighbor lock"),
        }
    }

    fn action_tx(&self) -> &ActionTable {
        match &self.actions {
            Some(tx) => &tx.working,
            None => panic!("transaction does not hold the NeighborhoodAction lock"),
        }
    }

    fn action_tx_mut(&mut self) -> &mut ActionTable {
        match &mut self.actions {
            Some(tx) => &mut tx.working,
            None => panic!("transaction does not hold the NeighborhoodAction lock"),
        }
    }

    // ── Neighbor repository ──────────────────────────────────────────────────

    pub fn neighbor_count(&self) -> usize {
        self.neighbor_tx().rows.len()
    }

    pub fn get_neighbor(&self, neighbor_id: &[u8]) -> Option<Neighbor> {
        self.neighbor_tx().rows.get(neighbor_id).cloned()
    }

    pub fn find_neighbors(&self, predicate: impl Fn(&Neighbor) -> bool) -> Vec<Neighbor> {
        self.neighbor_tx()
            .rows
            .values()
            .filter(|n| predicate(n))
            .cloned()
            .collect()
    }

    pub fn insert_neighbor(&mut self, neighbor: Neighbor) -> Result<(), StoreError> {
        let rows = &mut self.neighbor_tx_mut().rows;
        if rows.contains_key(&neighbor.neighbor_id) {
            return Err(StoreError::DuplicateNeighbor(neighbor.neighbor_id));
        }
        rows.insert(neighbor.neighbor_id.clone(), neighbor);
        Ok(())
    }

    pub fn update_neighbor(&mut self, neighbor: Neighbor) -> Result<(), StoreError> {
        let rows = &mut self.neighbor_tx_mut().rows;
        if !rows.contains_key(&neighbor.neighbor_id) {
            return Err(StoreError::UnknownNeighbor(neighbor.neighbor_id));
        }
        rows.insert(neighbor.neighbor_id.clone(), neighbor);
        Ok(())
    }

    // ── Action repository ────────────────────────────────────────────────────

    /// Enqueue an action. Returns the assigned queue id.
    pub fn insert_action(&mut self, action: NewAction) -> u64 {
        let table = self.action_tx_mut();
        let id = table.next_id;
        table.next_id += 1;
        table.rows.push(NeighborhoodAction {
            id,
            server_id: action.server_id,
            kind: action.kind,
            timestamp: action.timestamp,
            execute_after: action.execute_after,
            target_identity_id: None,
            additional_data: None,
        });
        id
    }

    /// Whether an action of this kind is already queued for the server.
    pub fn has_pending_action(&self, server_id: &[u8], kind: NeighborhoodActionKind) -> bool {
        self.action_tx()
            .rows
            .iter()
            .any(|a| a.kind == kind && a.server_id == server_id)
    }

    // ── Unit of work ─────────────────────────────────────────────────────────

    /// Mark the staged changes for persistence. Without this, `commit`
    /// publishes nothing (an empty commit).
    pub fn save(&mut self) {
        self.dirty = true;
    }

    /// Publish the working copies and release the locks. A transaction
    /// that never called `save` commits empty.
    pub fn commit(mut self) {
        if self.dirty {
            if let Some(tx) = &mut self.neighbors {
                *tx.guard = std::mem::take(&mut tx.working);
            }
            if let Some(tx) = &mut self.actions {
                *tx.guard = std::mem::take(&mut tx.working);
            }
        }
    }

    /// Discard the working copies and release the locks. Dropping the
    /// transaction without committing does the same.
    pub fn rollback(self) {}
}

// ── Tests ─────────────────────────────────────────────────────────────────────
