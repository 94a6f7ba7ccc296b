pub mod auto_retry;
pub mod connectivity;
pub mod retry_status;

pub use auto_retry::{setup_auto_retry, RetryHandle, TriggerReason};
pub use connectivity::{Connectivity, ConnectivityMonitor, ConnectivitySignal, ConnectivityState};
pub use retry_status::{RetryStatus, SharedRetryStatus};
