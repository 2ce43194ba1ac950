//! Data model: request records, the opaque operation/argument bundle, and
//! the identifiers the engine hands back to clients.

use serde::{Deserialize, Serialize};

use crate::clock::Instant;
use crate::error::EngineError;

pub type RequestId = String;
pub type CredentialId = usize;

pub fn new_request_id() -> RequestId {
    uuid::Uuid::new_v4().to_string()
}

/// The upstream operation and its arguments, opaque to the engine beyond
/// its tag — the engine never inspects `args`, only forwards it to the
/// adapter. One variant per supported operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum Operation {
    Generate {
        model: String,
        args: serde_json::Value,
    },
    GenerateStream {
        model: String,
        args: serde_json::Value,
    },
    Embed {
        model: String,
        args: serde_json::Value,
    },
    CountTokens {
        model: String,
        args: serde_json::Value,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Generate { .. } => "generate",
            Operation::GenerateStream { .. } => "generate-stream",
            Operation::Embed { .. } => "embed",
            Operation::CountTokens { .. } => "count-tokens",
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Operation::GenerateStream { .. })
    }
}

pub type EngineValue = serde_json::Value;

/// A client-facing credential, opaque to the engine beyond equality — the
/// engine never interprets it, only stores it alongside the record for
/// whichever external layer wants to attribute usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredential(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The mutable record owned by the Request Store (C3). `result` and
/// `error` are mutually exclusive in terminal states.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: RequestId,
    pub client_credential: ClientCredential,
    pub enqueued_at: Instant,
    pub priority: i32,
    pub operation: Operation,
    pub status: RequestStatus,
    pub result: Option<EngineValue>,
    pub error: Option<EngineError>,
    pub assigned_credential: Option<CredentialId>,
    pub terminal_at: Option<Instant>,
}

impl RequestRecord {
    pub fn new(
        id: RequestId,
        client_credential: ClientCredential,
        priority: i32,
        operation: Operation,
        enqueued_at: Instant,
    ) -> Self {
        Self {
            id,
            client_credential,
            enqueued_at,
            priority,
            operation,
            status: RequestStatus::Pending,
            result: None,
            error: None,
            assigned_credential: None,
            terminal_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RequestStatus::Completed | RequestStatus::Failed)
    }
}
