use thiserror::Error;

/// Failure classes surfaced by node operations. Only `Conflict` and `Transient` are worth retrying,
/// and only the caller decides whether to.
#[derive(Debug, Error)]
pub enum NodeError {
    /// No address satisfied any of the requested address types
    #[error("{0}")]
    NotFound(String),

    /// A node could not be represented for comparison
    #[error("serializing node: {0}")]
    Serialization(String),

    /// The stored object changed since the caller read it. Re-fetch, recompute and try again.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Conflict(_) | NodeError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, NodeError::Conflict(_))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<etcd_client::Error> for NodeError {
    fn from(err: etcd_client::Error) -> Self {
        match &err {
            etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => NodeError::Transient(err.to_string()),
            etcd_client::Error::GRpcStatus(status) => match status.code() {
                tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Aborted => NodeError::Transient(err.to_string()),
                _ => NodeError::Fatal(err.to_string()),
            },
            _ => NodeError::Fatal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(NodeError::Conflict("node worker-0 changed".to_string()).is_retryable());
        assert!(NodeError::Transient("connection refused".to_string()).is_retryable());
        assert!(!NodeError::Fatal("bad patch".to_string()).is_retryable());
        assert!(!NodeError::NotFound("no preferred addresses found; known addresses: []".to_string()).is_retryable());
    }

    #[test]
    fn test_grpc_status_classification() {
        let unavailable = etcd_client::Error::GRpcStatus(tonic::Status::unavailable("etcdserver: leader changed"));
        assert!(matches!(NodeError::from(unavailable), NodeError::Transient(_)));

        let invalid = etcd_client::Error::GRpcStatus(tonic::Status::invalid_argument("etcdserver: request is too large"));
        assert!(matches!(NodeError::from(invalid), NodeError::Fatal(_)));
    }
}
