//! The file-mediated command/response channel between short-lived CLI
//! invocations and the worker.
//!
//! Commands are appended to `commands.jsonl` under the cross-process lock;
//! the worker drains the file on a tick, executes each command in file
//! order, and appends one result per command to `results.jsonl`.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Command variants the worker executes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    /// Sign, DM-encrypt, and publish to a peer.
    Send { target: String, content: String },
    /// Permission-check, group-encrypt, publish, and record to history.
    GroupSend {
        #[serde(rename = "groupId")]
        group_id: String,
        topic: String,
        content: String,
    },
    /// Ensure a subscription exists for the topic (idempotent).
    JoinGroup {
        #[serde(rename = "groupId")]
        group_id: String,
        topic: String,
    },
    /// Close the topic subscription (idempotent).
    LeaveGroup {
        #[serde(rename = "groupId")]
        group_id: String,
        topic: String,
    },
    /// Trigger graceful shutdown.
    Stop,
}

/// One line of the command file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Client-generated id the result is keyed by.
    pub id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

/// One line of the results file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub cmd_id: String,
    pub success: bool,
    /// Stable machine code; `OK` on success.
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Completion time, ms.
    pub ts: i64,
}

impl CommandResult {
    /// A success result for `cmd_id`.
    pub fn ok(cmd_id: impl Into<String>, ts: i64) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            success: true,
            code: "OK".to_string(),
            message: None,
            ts,
        }
    }

    /// A failure result carrying the incident code and its human message.
    pub fn fail(cmd_id: impl Into<String>, code: ErrorCode, ts: i64) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            success: false,
            code: code.as_str().to_string(),
            message: Some(code.to_string()),
            ts,
        }
    }

    /// A failure result with an operation-specific detail message.
    pub fn fail_with(
        cmd_id: impl Into<String>,
        code: ErrorCode,
        detail: impl Into<String>,
        ts: i64,
    ) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            success: false,
            code: code.as_str().to_string(),
            message: Some(detail.into()),
            ts,
        }
    }
}
