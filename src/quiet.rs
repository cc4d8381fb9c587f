//! Scoped log suppression around noisy calls.

use tracing::subscriber::{NoSubscriber, with_default};

/// Run `operation` with every `tracing` event on this thread discarded.
///
/// The previous dispatcher is restored when the closure returns, errors, or
/// unwinds.
pub fn quietly<T>(operation: impl FnOnce() -> T) -> T {
    with_default(NoSubscriber::default(), operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_closure_result() {
        let value = quietly(|| {
            tracing::info!("suppressed");
            41 + 1
        });
        assert_eq!(value, 42);
    }

    #[test]
    fn propagates_errors_unchanged() {
        let result: Result<(), String> = quietly(|| Err("listing failed".to_string()));
        assert_eq!(result.unwrap_err(), "listing failed");
    }

    #[test]
    fn panics_still_unwind_through() {
        let outcome = std::panic::catch_unwind(|| quietly(|| panic!("boom")));
        assert!(outcome.is_err());
        assert_eq!(quietly(|| 1), 1);
    }
}
