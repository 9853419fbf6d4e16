//! Error taxonomy surfaced to callers awaiting a stream.
//!
//! Every error that reaches a caller's `wait()` is one of these variants;
//! raw transport or parse errors never escape the receive loop.

/// Error delivered through a rejected [`Deferred`](crate::deferred::Deferred).
///
/// `Clone` because one transport failure rejects every pending wait on a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Transport refused, reset or closed by the remote side.
    #[error("network error on {url}: {reason}")]
    Network { url: String, reason: String },
    /// Connection handshake or keepalive ran out of time.
    #[error("request timeout on {url}: {reason}")]
    RequestTimeout { url: String, reason: String },
    /// Order book could not be brought back in sync.
    #[error("order book for {symbol} is inconsistent: {reason}")]
    Consistency { symbol: String, reason: String },
    /// The subscription was removed while a caller was still waiting.
    #[error("unsubscribed from {0}")]
    Unsubscribed(String),
    /// The connection or session was closed explicitly.
    #[error("closed by user")]
    ClosedByUser,
    /// This particular wait was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// Error reported by the exchange for one message hash.
    #[error("exchange error: {0}")]
    Exchange(String),
}

impl StreamError {
    /// True for transport-level failures that end a connection generation.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            StreamError::Network { .. } | StreamError::RequestTimeout { .. }
        )
    }

    pub(crate) fn network(url: &str, reason: impl Into<String>) -> Self {
        StreamError::Network {
            url: cm_core::logging::redact_url(url),
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(url: &str, reason: impl Into<String>) -> Self {
        StreamError::RequestTimeout {
            url: cm_core::logging::redact_url(url),
            reason: reason.into(),
        }
    }

    pub(crate) fn consistency(symbol: &str, reason: impl Into<String>) -> Self {
        StreamError::Consistency {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_redacts_url() {
        let err = StreamError::network("wss://x.example.com/ws?listenKey=abc", "reset");
        assert_eq!(
            err.to_string(),
            "network error on wss://x.example.com/ws?[REDACTED]: reset"
        );
        assert!(err.is_network());
    }

    #[test]
    fn test_non_network_errors() {
        assert!(!StreamError::ClosedByUser.is_network());
        assert!(!StreamError::Unsubscribed("ticker:BTC/USDT".into()).is_network());
        assert!(StreamError::timeout("wss://a", "handshake").is_network());
    }
}
