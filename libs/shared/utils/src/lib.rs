pub mod retry;
pub mod test_utils;

pub use retry::{retry_with_backoff, RetryPolicy};
