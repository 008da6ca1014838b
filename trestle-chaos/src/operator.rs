//! Fault operator contract.

use async_trait::async_trait;

use crate::error::ChaosError;

/// One injectable infrastructure fault with exactly two logical states.
///
/// An operator is inactive until `activate` injects the fault and active
/// until `deactivate` reverses it. Transitions are driven from two sides,
/// scenario steps and the manager's background loop, and the manager
/// serializes them; implementations only guard their own tracking state.
#[async_trait]
pub trait ChaosOperator: Send + Sync {
    /// Stable name for logs.
    fn name(&self) -> &str;

    /// Whether the fault can be injected right now.
    async fn can_activate(&self) -> bool;

    /// Whether the fault can be reversed right now.
    ///
    /// Defaults to the negation of [`can_activate`](Self::can_activate);
    /// operators with more than two observable states override it.
    async fn can_deactivate(&self) -> bool {
        !self.can_activate().await
    }

    /// Inject the fault. Activating an active operator is an error.
    async fn activate(&self) -> Result<(), ChaosError>;

    /// Reverse the fault. Deactivating an inactive operator is an error.
    async fn deactivate(&self) -> Result<(), ChaosError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Operator that only overrides `can_activate`.
    struct Flaky {
        active: AtomicBool,
    }

    #[async_trait]
    impl ChaosOperator for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn can_activate(&self) -> bool {
            !self.active.load(Ordering::SeqCst)
        }

        async fn activate(&self) -> Result<(), ChaosError> {
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn deactivate(&self) -> Result<(), ChaosError> {
            self.active.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn can_deactivate_defaults_to_negation() {
        let op = Flaky {
            active: AtomicBool::new(false),
        };

        assert!(op.can_activate().await);
        assert!(!op.can_deactivate().await);

        op.activate().await.unwrap();

        assert!(!op.can_activate().await);
        assert!(op.can_deactivate().await);
    }
}
