use farsock_wire::{FaultCode, WireError};

/// Errors surfaced by the link engine.
///
/// Callers of connect/bind/send/receive observe exactly one of these,
/// carrying the last relevant fault from the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No reachable proxy for the target — every candidate was exhausted.
    #[error("no proxy online")]
    NotFound,

    /// A control RPC exceeded its timeout.
    #[error("proxy call timed out")]
    Timeout,

    /// Protocol-level fault reported by the remote side.
    #[error("socket fault: {0:?}")]
    Socket(FaultCode),

    /// Internal retry marker for directory operations.
    #[error("transient directory fault: {0}")]
    Transient(String),

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Wraps unexpected transport or service failures.
    #[error("proxy fault: {0}")]
    Fault(String),
}

impl ProxyError {
    /// The fault code this error maps to on the wire.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            ProxyError::NotFound => FaultCode::NoHost,
            ProxyError::Timeout => FaultCode::Timeout,
            ProxyError::Socket(code) => *code,
            ProxyError::Transient(_) | ProxyError::Fault(_) | ProxyError::Wire(_) => {
                FaultCode::Fatal
            }
            ProxyError::Cancelled => FaultCode::Closed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProxyError::Cancelled)
    }

    /// Whether the remote side reported the session as already closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, ProxyError::Socket(FaultCode::Closed))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProxyError::Timeout | ProxyError::Socket(FaultCode::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_code_mapping() {
        assert_eq!(ProxyError::NotFound.fault_code(), FaultCode::NoHost);
        assert_eq!(ProxyError::Timeout.fault_code(), FaultCode::Timeout);
        assert_eq!(
            ProxyError::Socket(FaultCode::Closed).fault_code(),
            FaultCode::Closed
        );
    }

    #[test]
    fn classification_helpers() {
        assert!(ProxyError::Socket(FaultCode::Closed).is_closed());
        assert!(!ProxyError::Socket(FaultCode::Timeout).is_closed());
        assert!(ProxyError::Timeout.is_timeout());
        assert!(ProxyError::Socket(FaultCode::Timeout).is_timeout());
        assert!(ProxyError::Cancelled.is_cancelled());
    }
}
