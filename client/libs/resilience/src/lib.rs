/// Delivery resilience helpers for the analytics export path
///
/// This library provides the two primitives the export transports lean on:
/// - **Backoff**: bounded attempts with exponential delays (`base * 2^attempt`)
/// - **Timeout**: time limits on a single delivery attempt
///
/// # Example: retry a batch upload
///
/// ```rust,no_run
/// use resilience::{with_backoff, BackoffPolicy};
///
/// #[tokio::main]
/// async fn main() {
///     let policy = BackoffPolicy::default();
///
///     let result = with_backoff(&policy, |attempt| async move {
///         // POST the batch here
///         if attempt < 1 { Err("503") } else { Ok(()) }
///     })
///     .await;
///
///     assert!(result.is_ok());
/// }
/// ```

pub mod retry;
pub mod timeout;

pub use retry::{with_backoff, with_backoff_when, BackoffPolicy, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutError};
