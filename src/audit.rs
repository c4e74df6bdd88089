//! Correlation ids for long-lived operations.
//!
//! Every scheduler tick and every webhook delivery gets its own job id so
//! log lines across components can be stitched back together.

use uuid::Uuid;

pub const JOB_INCREMENTAL_SYNC: &str = "sync-inc";
pub const JOB_FULL_SYNC: &str = "sync-full";
pub const JOB_FFN_POLL: &str = "jtl-poll";
pub const JOB_TOKEN_REFRESH: &str = "token-refresh";
pub const JOB_STOCK_SYNC: &str = "stock-sync";
pub const JOB_INBOUND_POLL: &str = "inbound-poll";
pub const JOB_COMMERCE_RECONCILE: &str = "commerce-reconcile";
pub const JOB_PAID_SWEEP: &str = "paid-sweep";
pub const JOB_WEBHOOK: &str = "webhook";

pub fn job_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &uuid[..12])
}
