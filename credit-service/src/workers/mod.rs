pub mod reconciler;

pub use reconciler::{AccountReconciliation, ReconciliationScheduler, Reconciler, TickSummary};
