pub mod aggregator;
pub mod catalog;
pub mod credits;
pub mod database;
pub mod depletion;
pub mod enforcement;
pub mod entitlement;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod store;

pub use aggregator::{IngestOutcome, UsageAggregator};
pub use catalog::ProductCatalog;
pub use credits::{CreditService, CreditSummary, RedeemError};
pub use database::Database;
pub use depletion::LedgerSnapshot;
pub use enforcement::{
    EnforcementGateway, InstanceController, LogInstanceController, MockInstanceController,
    TerminateOutcome,
};
pub use entitlement::EntitlementState;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{LogNotificationSink, MockNotificationSink, NotificationSink};
pub use store::LedgerStore;
