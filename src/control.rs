//! Line-oriented JSON protocol for status queries and operator commands.
//!
//! Commands never touch the pack directly. A status query is answered from
//! the latest published snapshot; balance and latch-reset requests are
//! checked against that snapshot and then queued for the supervisor, which
//! applies them at the start of its next poll.

use crate::balance::{plan_manual, BalanceRequest};
use crate::snapshot::Snapshot;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use thiserror::Error;
use tracing::{info, warn};

pub const MAX_COMMAND_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 1024;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;
pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub id: u32,
    pub command: CommandType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    Status,
    Balance,
    ResetLatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub id: u32,
    pub status: ResponseStatus,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Rejected,
    Error,
}

/// What the supervisor is asked to do on its next poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlRequest {
    Balance(BalanceRequest),
    ResetLatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("message exceeds {MAX_COMMAND_SIZE} bytes")]
    MessageTooLarge,
    #[error("invalid command: {0}")]
    InvalidJson(String),
    #[error("serialization failed")]
    SerializationError,
    #[error("supervisor is not running")]
    SupervisorGone,
}

pub struct ControlHandler {
    command_buffer: CommandBuffer,
    response_buffer: ResponseBuffer,
    requests: Sender<ControlRequest>,
    spread_threshold: f64,
}

impl ControlHandler {
    pub fn new(requests: Sender<ControlRequest>, spread_threshold: f64) -> Self {
        Self {
            command_buffer: ArrayString::new(),
            response_buffer: ArrayString::new(),
            requests,
            spread_threshold,
        }
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<ControlCommand, ControlError> {
        self.command_buffer.clear();
        if json_str.len() > MAX_COMMAND_SIZE {
            return Err(ControlError::MessageTooLarge);
        }
        self.command_buffer.push_str(json_str);

        serde_json::from_str::<ControlCommand>(&self.command_buffer)
            .map_err(|e| ControlError::InvalidJson(e.to_string()))
    }

    /// Serializes a response. Short responses go through the bounded
    /// buffer; a status response carrying a snapshot is returned as is.
    pub fn serialize_response(&mut self, response: &ControlResponse) -> Result<String, ControlError> {
        let json_str =
            serde_json::to_string(response).map_err(|_| ControlError::SerializationError)?;
        if response.snapshot.is_some() {
            return Ok(json_str);
        }
        self.response_buffer.clear();
        if json_str.len() > MAX_RESPONSE_SIZE {
            return Err(ControlError::MessageTooLarge);
        }
        self.response_buffer.push_str(&json_str);
        Ok(self.response_buffer.to_string())
    }

    pub fn handle(&self, command: &ControlCommand, snapshot: &Snapshot) -> ControlResponse {
        match command.command {
            CommandType::Status => ControlResponse {
                id: command.id,
                status: ResponseStatus::Success,
                message: None,
                snapshot: Some(snapshot.clone()),
            },
            CommandType::Balance => {
                let planned = plan_manual(
                    &snapshot.voltages,
                    !snapshot.alerts.is_empty(),
                    snapshot.balancing,
                    self.spread_threshold,
                );
                match planned {
                    Ok(request) => match self.enqueue(ControlRequest::Balance(request)) {
                        Ok(()) => {
                            info!(
                                "Manual balance queued from Bank {} to Bank {}",
                                request.source, request.dest
                            );
                            Self::reply(
                                command.id,
                                ResponseStatus::Success,
                                format!(
                                    "Balancing initiated from Bank {} to Bank {}",
                                    request.source, request.dest
                                ),
                            )
                        }
                        Err(e) => Self::reply(command.id, ResponseStatus::Error, e.to_string()),
                    },
                    Err(rejected) => {
                        warn!("Manual balance rejected: {}", rejected);
                        Self::reply(command.id, ResponseStatus::Rejected, rejected.to_string())
                    }
                }
            }
            CommandType::ResetLatch => match self.enqueue(ControlRequest::ResetLatch) {
                Ok(()) => Self::reply(command.id, ResponseStatus::Success, "Latch reset requested".to_string()),
                Err(e) => Self::reply(command.id, ResponseStatus::Error, e.to_string()),
            },
        }
    }

    fn enqueue(&self, request: ControlRequest) -> Result<(), ControlError> {
        self.requests
            .send(request)
            .map_err(|_| ControlError::SupervisorGone)
    }

    fn reply(id: u32, status: ResponseStatus, message: String) -> ControlResponse {
        ControlResponse {
            id,
            status,
            message: Some(message),
            snapshot: None,
        }
    }

    /// Response for a line that did not parse.
    pub fn error_response(error: &ControlError) -> ControlResponse {
        ControlResponse {
            id: 0,
            status: ResponseStatus::Error,
            message: Some(error.to_string()),
            snapshot: None,
        }
    }
}
