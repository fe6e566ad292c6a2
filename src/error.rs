use thiserror::Error;

/// Core error taxonomy. Errors cross plugin boundaries only as one of
/// these values; binder- and structure-level failures are converted to
/// in-place `<error>` elements instead of propagating.
#[derive(Clone, Debug, Error)]
pub enum CoreError {
    /// Fatal at load time; the previous good snapshot is retained.
    #[error("repository load error: {0}")]
    RepoLoad(String),

    /// Identity or profile cannot be resolved; fatal for the session.
    #[error("metadata consistency error: {0}")]
    MetadataConsistency(String),

    #[error("authentication failed: {0}")]
    MetadataAuth(String),

    /// Transient (DNS timeout, deadline); the client may retry.
    #[error("metadata runtime error: {0}")]
    MetadataRuntime(String),

    /// The client asked for a configuration while probes it was issued
    /// are still outstanding.
    #[error("probe ordering violation: {0}")]
    ProbeOrder(String),

    #[error("structure error: {0}")]
    Structure(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("plugin {plugin} failed: {message}")]
    PluginExecution { plugin: String, message: String },
}

impl CoreError {
    pub fn plugin(plugin: &str, message: impl Into<String>) -> Self {
        CoreError::PluginExecution {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    /// XML-RPC fault code for errors that surface to the wire.
    /// 1 = auth, 2 = consistency, 3 = runtime. Unknown methods are
    /// fault 7, produced directly by the dispatcher.
    pub fn fault_code(&self) -> i32 {
        match self {
            CoreError::MetadataAuth(_) => 1,
            CoreError::MetadataConsistency(_) => 2,
            _ => 3,
        }
    }
}
