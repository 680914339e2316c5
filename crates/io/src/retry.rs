use salesync_config::RetryConfig;
use tracing::warn;

use crate::error::{Result, SyncError};

/// Run `op`, re-running it after a fixed delay while it fails with a
/// transient error. `policy.attempts` counts the first try.
///
/// Exhaustion surfaces as `TransientDb` carrying the number of attempts made.
pub fn with_retry<T, F>(policy: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(
                    "Transient failure during {}, retry {}/{}: {}",
                    operation, attempt, policy.attempts, e
                );
                std::thread::sleep(policy.delay());
                attempt += 1;
            }
            Err(SyncError::TransientDb { message, .. }) => {
                return Err(SyncError::TransientDb {
                    operation: operation.to_string(),
                    attempts: attempt,
                    message,
                })
            }
            Err(e) => return Err(e),
        }
    }
}
