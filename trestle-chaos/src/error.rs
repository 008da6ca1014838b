//! Chaos subsystem error types.

use trestle_testbed::TestbedError;

/// Errors from chaos operators and the manager.
#[derive(Debug, thiserror::Error)]
pub enum ChaosError {
    /// Activation requested while the fault is already live.
    #[error("operator {0} is already active")]
    AlreadyActive(String),

    /// Deactivation requested while no fault is live.
    #[error("operator {0} is not active")]
    NotActive(String),

    /// No topology nodes match the operator's target role.
    #[error("no eligible nodes with role {role}")]
    NoEligibleNodes {
        /// Role the operator targets.
        role: String,
    },

    /// The same operator instance was registered twice.
    #[error("operator {0} is already registered")]
    AlreadyRegistered(String),

    /// Removal of an operator that was never registered.
    #[error("operator {0} is not registered")]
    NotRegistered(String),

    /// The scheduling loop is already running.
    #[error("chaos manager is already running")]
    AlreadyRunning,

    /// The scheduling loop is not running.
    #[error("chaos manager is not running")]
    NotRunning,

    /// Rejected configuration value.
    #[error("invalid chaos config: {0}")]
    InvalidConfig(String),

    /// Underlying cluster operation failed.
    #[error("cluster operation failed: {0}")]
    Cluster(#[from] TestbedError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ChaosError::NoEligibleNodes {
            role: "pd".to_string(),
        };
        assert_eq!(err.to_string(), "no eligible nodes with role pd");

        let err = ChaosError::AlreadyActive("node-offline-pd".to_string());
        assert_eq!(err.to_string(), "operator node-offline-pd is already active");
    }

    #[test]
    fn cluster_errors_convert() {
        let err: ChaosError = TestbedError::Api("conflict".to_string()).into();
        assert!(matches!(err, ChaosError::Cluster(_)));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChaosError>();
    }
}
