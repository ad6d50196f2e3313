use tracing::{error, warn};

/// Decides how a failed transaction should continue.
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq)]
pub enum StateError<E> {
    /// The failure is transient. The control flow should retry if possible.
    ///
    /// See: [`retry_if_possible`]
    Retry(E),
    /// The failure is permanent. The control flow should exit immediately.
    Stop(E),
}

/// The result of a single attempt of a transaction.
pub type StateResult<T, E> = Result<T, StateError<E>>;

/// Decides whether retrying is allowed based on the retries made so far and a maximum.
///
/// Increments `retry` and returns `true` if another attempt may be made.
pub fn retry_if_possible(retry: &mut u8, max_retries: u8) -> bool {
    *retry = retry.saturating_add(1);
    if *retry > max_retries {
        error!("retried for too many times ({max_retries}), stopping!");
        false
    } else {
        warn!("retrying… ({retry} / {max_retries})");
        true
    }
}
