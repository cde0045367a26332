// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Line-delimited JSON exchanged with the bridge process: one request on
//! stdin, one response as the last non-empty line on stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::ports::TransportError;
use crate::app::types::{
    CancelOutcome, CommandResult, CommandSpec, JobHandle, JobStatus, JobStatusReport,
};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request<'a> {
    Connect,
    Invoke {
        command: &'a CommandSpec,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    Poll {
        job: &'a str,
    },
    Cancel {
        job: &'a str,
    },
    Disconnect,
}

impl Request<'_> {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Connect => "connect",
            Request::Invoke { .. } => "invoke",
            Request::Poll { .. } => "poll",
            Request::Cancel { .. } => "cancel",
            Request::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    Rejected,
    SessionExpired,
    Authentication,
    Malformed,
    Unsupported,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default)]
        payload: Value,
    },
    Error {
        #[serde(default)]
        kind: ErrorKind,
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
    Deferred {
        job: String,
    },
}

/// Restore-request statistics as the bridge forwards them.
#[derive(Debug, Deserialize)]
struct PollPayload {
    #[serde(alias = "Status")]
    status: String,
    #[serde(default, alias = "PercentComplete")]
    percent_complete: Option<f32>,
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

pub fn parse_response(stdout: &str) -> Result<Response, TransportError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or_else(|| TransportError::Protocol("bridge produced no response".into()))?;
    serde_json::from_str(line)
        .map_err(|err| TransportError::Protocol(format!("unreadable bridge response: {err}")))
}

fn common_error(kind: ErrorKind, message: String) -> Option<TransportError> {
    match kind {
        ErrorKind::SessionExpired => Some(TransportError::SessionExpired(message)),
        ErrorKind::Authentication => Some(TransportError::Authentication(message)),
        ErrorKind::Malformed => Some(TransportError::Malformed(message)),
        ErrorKind::Rejected | ErrorKind::Unsupported => None,
    }
}

pub fn connect_outcome(response: Response) -> Result<(), TransportError> {
    match response {
        Response::Ok { .. } => Ok(()),
        Response::Error { kind, message, .. } => Err(common_error(kind, message.clone())
            .unwrap_or(TransportError::Network {
                message,
                request_sent: true,
            })),
        Response::Deferred { .. } => Err(TransportError::Protocol(
            "connect answered with a job handle".into(),
        )),
    }
}

pub fn invoke_outcome(response: Response) -> Result<CommandResult, TransportError> {
    match response {
        Response::Ok { payload } => Ok(CommandResult::ImmediateSuccess(payload)),
        Response::Deferred { job } => Ok(CommandResult::Deferred(JobHandle::new(job))),
        Response::Error {
            kind,
            code,
            message,
        } => match common_error(kind, message.clone()) {
            Some(err) => Err(err),
            None => Ok(CommandResult::ImmediateFailure { code, message }),
        },
    }
}

pub fn poll_outcome(response: Response) -> Result<JobStatusReport, TransportError> {
    match response {
        Response::Ok { payload } => {
            let payload: PollPayload = serde_json::from_value(payload)
                .map_err(|err| TransportError::Protocol(format!("unreadable job status: {err}")))?;
            let status: JobStatus = payload.status.parse().map_err(TransportError::Protocol)?;
            Ok(JobStatusReport {
                status,
                progress_percent: payload.percent_complete,
                message: payload.message,
            })
        }
        Response::Error { kind, message, .. } => Err(common_error(kind, message.clone())
            .unwrap_or(TransportError::Protocol(format!("job poll failed: {message}")))),
        Response::Deferred { .. } => Err(TransportError::Protocol(
            "poll answered with a job handle".into(),
        )),
    }
}

pub fn cancel_outcome(response: Response) -> Result<CancelOutcome, TransportError> {
    match response {
        Response::Ok { .. } => Ok(CancelOutcome::Requested),
        Response::Error {
            kind: ErrorKind::Unsupported,
            ..
        } => Ok(CancelOutcome::Unsupported),
        Response::Error { kind, message, .. } => Err(common_error(kind, message.clone())
            .unwrap_or(TransportError::Protocol(format!("job cancel failed: {message}")))),
        Response::Deferred { .. } => Err(TransportError::Protocol(
            "cancel answered with a job handle".into(),
        )),
    }
}
