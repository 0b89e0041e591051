//! Error types for graph construction and execution.
//!
//! All recoverable failures surface as [`GraphError`] values. Contract
//! violations by calculator authors — non-monotonic timestamps, typed access
//! to a mismatched payload, writing to a closed stream — are *not* errors:
//! they indicate bugs in calculator implementations and panic instead (each
//! panicking entry point documents this under `# Panics`).

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GraphError>;

/// The lifecycle stage in which a calculator callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStage {
    Open,
    Process,
    Close,
}

impl std::fmt::Display for NodeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStage::Open => write!(f, "Open"),
            NodeStage::Process => write!(f, "Process"),
            NodeStage::Close => write!(f, "Close"),
        }
    }
}

/// Errors produced by graph validation and execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// The graph configuration or node contracts are structurally invalid.
    ///
    /// Detected at construction or startup: unresolvable streams, duplicate
    /// producers, type mismatches across an edge, undeclared port types,
    /// unresolved side packet dependencies, undeclared cycles.
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A caller passed an invalid argument to a run-control operation,
    /// e.g. an unknown stream name or a non-increasing input timestamp.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the graph's current state,
    /// e.g. starting a run that is already running, or feeding a closed input.
    #[error("invalid graph state: {0}")]
    InvalidState(String),

    /// A calculator callback returned an error.
    ///
    /// The scheduler records the first such failure as the run's terminal
    /// status, closes all packet sources, and drains buffered data before
    /// `wait_until_done` reports it.
    #[error("calculator '{node}' failed in {stage}: {message}")]
    Calculator {
        /// Name of the failing node.
        node: String,
        /// Which lifecycle callback failed.
        stage: NodeStage,
        /// Error message from the calculator.
        message: String,
    },

    /// A calculator-internal failure without node context.
    ///
    /// Calculators typically return this from `open`/`process`/`close`; the
    /// scheduler wraps it with the node name and stage as
    /// [`GraphError::Calculator`] when recording it.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A non-blocking add was refused because a downstream queue is full.
    ///
    /// Expected and non-fatal: the caller may retry once the graph drains.
    #[error("input stream '{stream}' is throttled")]
    Throttled {
        /// The graph input stream that refused the packet.
        stream: String,
    },

    /// No further progress is possible under the configured queue limits.
    ///
    /// Reported only when `report_deadlock` is enabled; otherwise the
    /// scheduler resolves the stall by growing a queue past its limit.
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// The run was cancelled via `CalculatorGraph::cancel`.
    #[error("graph run was cancelled")]
    Cancelled,

    /// Returned by a calculator to stop the run.
    ///
    /// This is **not an error** but a control-flow signal: a source returning
    /// `Stop` has exhausted its data and is closed; a non-source returning
    /// `Stop` asks the graph to close all packet sources and drain. It never
    /// becomes the run's terminal status.
    #[error("stop requested")]
    Stop,
}

impl GraphError {
    /// Convenience constructor for [`GraphError::Validation`].
    pub fn validation(message: impl Into<String>) -> GraphError {
        GraphError::Validation(message.into())
    }

    /// Convenience constructor for [`GraphError::Execution`].
    pub fn execution(message: impl Into<String>) -> GraphError {
        GraphError::Execution(message.into())
    }

    /// True for [`GraphError::Stop`], the graceful-stop signal.
    pub fn is_stop(&self) -> bool {
        matches!(self, GraphError::Stop)
    }

    pub(crate) fn in_node(self, node: &str, stage: NodeStage) -> GraphError {
        match self {
            GraphError::Calculator { .. } | GraphError::Stop | GraphError::Cancelled => self,
            other => GraphError::Calculator {
                node: node.to_string(),
                stage,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_node_context() {
        let err = GraphError::execution("boom").in_node("resampler", NodeStage::Process);
        assert_eq!(
            err.to_string(),
            "calculator 'resampler' failed in Process: execution failed: boom"
        );
    }

    #[test]
    fn stop_is_not_wrapped() {
        let err = GraphError::Stop.in_node("source", NodeStage::Process);
        assert!(err.is_stop());
    }
}
