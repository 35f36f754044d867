//! Public types for the maintenance API
pub use crate::service::OrphanReport;
pub use crate::subscription::{PushSubscription, RenewalSummary};

#[derive(Debug, serde::Serialize)]
pub struct SubscriptionsResponse {
    pub subscriptions: Vec<PushSubscription>,
}
