//! Typed chain-client errors
//!
//! Node error strings are matched exactly once, here, where the RPC error is
//! first observed. Everything downstream works with [`ClientError`] variants.

use alloy::transports::{RpcError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Connectivity, timeouts, truncated responses
    #[error("transport error: {0}")]
    Transport(String),
    #[error("nonce too low")]
    NonceTooLow,
    #[error("replacement transaction underpriced")]
    ReplacementUnderpriced,
    #[error("transaction already known")]
    AlreadyKnown,
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,
    /// Execution reverted, with the decoded reason when the node returned one
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl ClientError {
    /// Classify a JSON-RPC error object returned by a node
    pub fn from_rpc(code: i64, message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("nonce too low") {
            return ClientError::NonceTooLow;
        }
        if lower.contains("replacement transaction underpriced")
            || lower.contains("transaction underpriced")
        {
            return ClientError::ReplacementUnderpriced;
        }
        if lower.contains("already known") || lower.contains("known transaction") {
            return ClientError::AlreadyKnown;
        }
        if lower.contains("insufficient funds") {
            return ClientError::InsufficientFunds;
        }
        if lower.contains("execution reverted") || code == 3 {
            let reason = message
                .split_once("execution reverted")
                .map(|(_, rest)| rest.trim_start_matches(':').trim())
                .unwrap_or(message);
            return ClientError::Reverted(reason.to_string());
        }
        if lower.contains("eof")
            || lower.contains("timeout")
            || lower.contains("connection")
            || lower.contains("too many requests")
            || lower.contains("temporarily unavailable")
        {
            return ClientError::Transport(message.to_string());
        }

        ClientError::Rpc {
            code,
            message: message.to_string(),
        }
    }

    /// Free-form text carried by the error, matched against known
    /// ignorable conditions
    pub fn detail(&self) -> Option<&str> {
        match self {
            ClientError::Reverted(reason) => Some(reason),
            ClientError::Rpc { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        if let Some(payload) = err.as_error_resp() {
            return ClientError::from_rpc(payload.code, &payload.message);
        }
        match err {
            RpcError::Transport(kind) => ClientError::Transport(kind.to_string()),
            // An endpoint answering with garbage is treated like one that is down
            RpcError::DeserError { err, .. } => {
                ClientError::Transport(format!("bad response: {}", err))
            }
            RpcError::NullResp => ClientError::Decode("null response".to_string()),
            other => ClientError::Decode(other.to_string()),
        }
    }
}
