//! Error types for the testbed.

use thiserror::Error;

/// Errors that can occur while provisioning or driving the cluster under test.
#[derive(Debug, Error)]
pub enum TestbedError {
    /// Kubernetes API call failed.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// The cluster backend rejected the request.
    #[error("cluster api error: {0}")]
    Api(String),

    /// I/O failure while streaming exec output.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Pods did not all reach Running within the startup budget.
    #[error("pods not ready after {waited_secs}s (phases: {phases})")]
    PodsNotReady {
        /// Seconds spent polling before giving up.
        waited_secs: u64,
        /// Last observed pod phases, comma separated.
        phases: String,
    },

    /// A running pod reported no IP address.
    #[error("pod {pod} has no ip address")]
    MissingPodIp {
        /// Pod name.
        pod: String,
    },

    /// Fewer pods came up than the cluster spec asked for.
    #[error("expected {expected} pods, found {found}")]
    MissingPods {
        /// Pod count the cluster spec asked for.
        expected: usize,
        /// Pod count actually observed.
        found: usize,
    },

    /// Exec stream was not attached.
    #[error("exec stream for pod {pod} not attached")]
    ExecStream {
        /// Pod name.
        pod: String,
    },

    /// Exec finished with a failure status.
    #[error("exec in pod {pod} failed: {message}")]
    ExecFailed {
        /// Pod name.
        pod: String,
        /// Failure message reported by the API server.
        message: String,
    },

    /// A probe returned unexpected output.
    #[error("probe on pod {pod} returned unexpected output: {output}")]
    ProbeFailed {
        /// Pod name.
        pod: String,
        /// Captured command output.
        output: String,
    },

    /// No nodes of the requested role exist in the topology.
    #[error("no nodes with role {role}")]
    NoNodes {
        /// Requested role tag.
        role: String,
    },
}
