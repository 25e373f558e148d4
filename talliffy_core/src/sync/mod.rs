//! Sync orchestration engine.
//!
//! `SyncScheduler` drives timer-based cycles over every company and the fixed master
//! sequence; `CompanySyncPipeline` runs user-triggered syncs. Both claim the single
//! process-wide session from `SyncStateManager` before doing any work.

pub mod invoker;
pub mod license;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod scheduler;
pub mod state;
pub mod traits;
pub mod watermark;

#[cfg(test)]
pub(crate) mod test_support;
