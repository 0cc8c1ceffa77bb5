//! vicinity-services — the neighborhood store, the reconciler that keeps
//! it in sync with the LBN, and the cross-component signals.

pub mod db;
pub mod model;
pub mod processor;
pub mod readiness;
pub mod reconciler;

pub use db::{DbLock, NeighborhoodStore, NewAction, StoreError, Transaction};
pub use model::{Neighbor, NeighborhoodAction, NeighborhoodActionKind};
pub use processor::ProcessorSignal;
pub use readiness::Readiness;
pub use reconciler::{
    NeighborhoodReconciler, ReconcileError, ReconcilerSettings, UpsertOutcome,
};
