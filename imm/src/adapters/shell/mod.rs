// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::app::ports::{RemoteCommandPort, TransportError};
use crate::app::types::{
    CancelOutcome, CommandResult, CommandSpec, Credential, JobHandle, JobStatusReport,
};
use crate::config::ShellConfig;

mod wire;

use wire::Request;

/// Environment variable the bridge reads the access token from. The token
/// never appears on a command line or in stdin.
pub const TOKEN_ENV: &str = "IMM_ACCESS_TOKEN";

const STDERR_TAIL: usize = 512;

/// Runs every remote call through a short-lived bridge process (for example a
/// PowerShell script wrapping the Exchange Online module). Timeouts are the
/// caller's: dropping a call kills its process.
pub struct ShellTransport {
    program: PathBuf,
    args: Vec<String>,
    token: Mutex<Option<String>>,
}

impl ShellTransport {
    pub fn new(config: &ShellConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            token: Mutex::new(None),
        }
    }

    fn token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    async fn call(
        &self,
        request: &Request<'_>,
        token: &str,
    ) -> Result<wire::Response, TransportError> {
        let op = request.op();
        let mut line = serde_json::to_vec(request)
            .map_err(|err| TransportError::Malformed(format!("unencodable request: {err}")))?;
        line.push(b'\n');

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(TOKEN_ENV, token)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TransportError::Network {
                message: format!("failed to start {}: {err}", self.program.display()),
                request_sent: false,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&line)
                .await
                .map_err(|err| TransportError::Network {
                    message: format!("bridge closed stdin: {err}"),
                    request_sent: false,
                })?;
            // Dropping stdin sends EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| TransportError::Network {
                message: format!("bridge did not finish: {err}"),
                request_sent: true,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(op, stderr = %tail(&stderr), "bridge stderr");
        }

        match wire::parse_response(&stdout) {
            Ok(response) => Ok(response),
            Err(_) if !output.status.success() => Err(TransportError::Network {
                message: format!(
                    "bridge exited with {}: {}",
                    output.status,
                    tail(&stderr).trim()
                ),
                request_sent: true,
            }),
            Err(err) => Err(err),
        }
    }

    async fn call_open(&self, request: &Request<'_>) -> Result<wire::Response, TransportError> {
        let token = self
            .token()
            .ok_or_else(|| TransportError::SessionExpired("channel is not open".into()))?;
        self.call(request, &token).await
    }
}

fn tail(text: &str) -> &str {
    let start = text.len().saturating_sub(STDERR_TAIL);
    let start = (start..text.len())
        .find(|idx| text.is_char_boundary(*idx))
        .unwrap_or(text.len());
    &text[start..]
}

#[async_trait]
impl RemoteCommandPort for ShellTransport {
    #[tracing::instrument(skip_all)]
    async fn open(&self, credential: &Credential) -> Result<(), TransportError> {
        let response = self.call(&Request::Connect, credential.secret()).await?;
        wire::connect_outcome(response)?;
        self.set_token(Some(credential.secret().to_string()));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(command = %command.name))]
    async fn send(&self, command: &CommandSpec) -> Result<CommandResult, TransportError> {
        let request = Request::Invoke {
            command,
            timeout_secs: command.timeout.map(|timeout| timeout.as_secs()),
        };
        wire::invoke_outcome(self.call_open(&request).await?)
    }

    #[tracing::instrument(skip_all, fields(job = %handle))]
    async fn poll_job(&self, handle: &JobHandle) -> Result<JobStatusReport, TransportError> {
        let request = Request::Poll {
            job: handle.as_str(),
        };
        wire::poll_outcome(self.call_open(&request).await?)
    }

    #[tracing::instrument(skip_all, fields(job = %handle))]
    async fn cancel_job(&self, handle: &JobHandle) -> Result<CancelOutcome, TransportError> {
        let request = Request::Cancel {
            job: handle.as_str(),
        };
        wire::cancel_outcome(self.call_open(&request).await?)
    }

    async fn close(&self) {
        let Some(token) = self.token() else {
            return;
        };
        self.set_token(None);
        if let Err(err) = self.call(&Request::Disconnect, &token).await {
            tracing::debug!(error = %err, "bridge disconnect failed");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    // Answers by op; echoes the token for connect so the test can see it.
    const BRIDGE: &str = r#"
read -r line
case "$line" in
  *'"op":"connect"'*)
    if [ "$IMM_ACCESS_TOKEN" = "good" ]; then echo '{"status":"ok"}';
    else echo '{"status":"error","kind":"authentication","message":"bad token"}'; fi ;;
  *'"op":"invoke"'*'Get-EXOMailbox'*)
    echo 'noise before the answer'
    echo '{"status":"ok","payload":{"Identity":"guid-1"}}' ;;
  *'"op":"invoke"'*)
    echo '{"status":"deferred","job":"rr-1"}' ;;
  *'"op":"poll"'*)
    echo '{"status":"ok","payload":{"Status":"Completed","PercentComplete":100}}' ;;
  *'"op":"cancel"'*)
    echo '{"status":"error","kind":"unsupported","message":"no"}' ;;
  *)
    echo '{"status":"ok"}' ;;
esac
"#;

    fn transport(script: &str) -> ShellTransport {
        ShellTransport::new(&ShellConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
        })
    }

    #[tokio::test]
    async fn round_trips_every_operation() {
        let transport = transport(BRIDGE);
        transport
            .open(&Credential::new("good", None))
            .await
            .unwrap();

        let result = transport
            .send(&CommandSpec::read("Get-EXOMailbox").param("Identity", "guid-1"))
            .await
            .unwrap();
        assert_eq!(
            result,
            CommandResult::ImmediateSuccess(json!({"Identity": "guid-1"}))
        );

        let result = transport
            .send(&CommandSpec::mutating("New-MailboxRestoreRequest"))
            .await
            .unwrap();
        assert_eq!(result, CommandResult::Deferred(JobHandle::new("rr-1")));

        let report = transport.poll_job(&JobHandle::new("rr-1")).await.unwrap();
        assert_eq!(report.progress_percent, Some(100.0));
        assert_eq!(
            transport.cancel_job(&JobHandle::new("rr-1")).await.unwrap(),
            CancelOutcome::Unsupported
        );
        transport.close().await;
        assert!(transport.token().is_none());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn calls_are_spanned_by_name_without_parameters() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NEW)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = transport(BRIDGE);
        transport
            .open(&Credential::new("good", None))
            .await
            .unwrap();
        transport
            .send(&CommandSpec::read("Get-EXOMailbox").param("Identity", "secret-guid"))
            .await
            .unwrap();
        transport.poll_job(&JobHandle::new("rr-1")).await.unwrap();
        transport.cancel_job(&JobHandle::new("rr-1")).await.unwrap();

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("send{command=Get-EXOMailbox}"), "{output}");
        assert!(output.contains("poll_job{job=rr-1}"), "{output}");
        assert!(output.contains("cancel_job{job=rr-1}"), "{output}");
        assert!(!output.contains("secret-guid"), "{output}");
        assert!(!output.contains("good"), "{output}");
    }

    #[tokio::test]
    async fn rejected_token_is_authentication_error() {
        let transport = transport(BRIDGE);
        let err = transport
            .open(&Credential::new("bad", None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Authentication(_)));
        assert!(transport.token().is_none());
    }

    #[tokio::test]
    async fn send_before_open_reports_expired_session() {
        let err = transport(BRIDGE)
            .send(&CommandSpec::read("Get-EXOMailbox"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SessionExpired(_)));
    }

    #[tokio::test]
    async fn missing_program_was_never_sent() {
        let transport = ShellTransport::new(&ShellConfig {
            program: PathBuf::from("/nonexistent/imm-bridge"),
            args: Vec::new(),
        });
        let err = transport
            .open(&Credential::new("good", None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Network {
                request_sent: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn crash_after_reading_request_is_ambiguous() {
        let transport = transport("read -r line; echo 'boom' >&2; exit 3");
        let err = transport
            .open(&Credential::new("good", None))
            .await
            .unwrap_err();
        match err {
            TransportError::Network {
                message,
                request_sent,
            } => {
                assert!(request_sent);
                assert!(message.contains("boom"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
