use thiserror::Error;

/// Stable error taxonomy for the run. Every variant carries a kind tag
/// (its own name) that is logged verbatim into the FullResult and used to
/// pick the process exit code.
#[derive(Debug, Error)]
pub enum PtbError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("network fabric error: {0}")]
    Fabric(String),

    #[error("supervisor error: {0}")]
    Supervisor(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("application error: {0}")]
    Application(String),

    #[error("integration error: {0}")]
    Integration(String),

    #[error("interrupted")]
    Interrupted,
}

impl PtbError {
    /// The stable kind tag logged alongside every ERROR-level FullResult entry.
    pub fn kind(&self) -> &'static str {
        match self {
            PtbError::Configuration(_) => "ConfigurationError",
            PtbError::Resource(_) => "ResourceError",
            PtbError::Fabric(_) => "FabricError",
            PtbError::Supervisor(_) => "SupervisorError",
            PtbError::Protocol(_) => "ProtocolError",
            PtbError::Agent(_) => "AgentError",
            PtbError::Application(_) => "ApplicationError",
            PtbError::Integration(_) => "IntegrationError",
            PtbError::Interrupted => "Interrupted",
        }
    }

    /// Process exit code per §7: 0 success, 1 core error before teardown,
    /// 2 success with at least one Application failure. This maps only the
    /// "core error" half; the run driver decides between 0 and 2 itself.
    pub fn exit_code(&self) -> i32 {
        match self {
            PtbError::Application(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(PtbError::Configuration("x".into()).kind(), "ConfigurationError");
        assert_eq!(PtbError::Interrupted.kind(), "Interrupted");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(PtbError::Fabric("x".into()).exit_code(), 1);
        assert_eq!(PtbError::Application("x".into()).exit_code(), 2);
    }
}
