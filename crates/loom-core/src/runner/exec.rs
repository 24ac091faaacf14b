//! Task actions: shell command or HTTP request.
//!
//! どちらも 1 回分の試行だけを扱う。リトライは `TaskRunner` 側。

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::HttpSpec;

use super::template::{TemplateError, render};

/// After the process exits, how long to keep draining pipes held by
/// grandchildren.
const PIPE_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),

    #[error("wait failed: {0}")]
    Wait(std::io::Error),

    #[error("exit status {0}")]
    Exit(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("http method {0} is not supported")]
    UnsupportedMethod(String),

    #[error("read {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("task has neither cmd nor http")]
    NoAction,
}

/// Result of one attempt. Output is kept on failure too.
#[derive(Debug)]
pub struct ExecOutcome {
    pub output: String,
    pub error: Option<ExecError>,
}

impl ExecOutcome {
    fn ok(output: String) -> Self {
        Self {
            output,
            error: None,
        }
    }

    fn failed(output: String, error: ExecError) -> Self {
        Self {
            output,
            error: Some(error),
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&chunk[..n]),
        }
    }
}

/// Run `sh -c <cmd>` capturing stdout and stderr into one buffer.
///
/// timeout / cancel のどちらでもプロセスを kill し、終了を待ってから返す。
pub async fn run_command(
    cmd: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> ExecOutcome {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return ExecOutcome::failed(String::new(), ExecError::Spawn(e)),
    };

    let buf = Arc::new(Mutex::new(Vec::new()));
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, Arc::clone(&buf))));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, Arc::clone(&buf))));
    }

    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    let error = tokio::select! {
        status = child.wait() => match status {
            Ok(s) if s.success() => None,
            Ok(s) => Some(ExecError::Exit(s.to_string())),
            Err(e) => Some(ExecError::Wait(e)),
        },
        _ = deadline => {
            kill(&mut child).await;
            Some(ExecError::Timeout(timeout.unwrap_or_default()))
        }
        _ = cancel.cancelled() => {
            kill(&mut child).await;
            Some(ExecError::Cancelled)
        }
    };

    for handle in pumps {
        let abort = handle.abort_handle();
        if tokio::time::timeout(PIPE_GRACE, handle).await.is_err() {
            abort.abort();
        }
    }

    let output = String::from_utf8_lossy(&buf.lock().unwrap_or_else(|e| e.into_inner())).into_owned();
    debug!(cmd, bytes = output.len(), failed = error.is_some(), "command finished");
    ExecOutcome { output, error }
}

async fn kill(child: &mut tokio::process::Child) {
    // kill() は SIGKILL を送って終了まで待つ
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill child process");
    }
}

/// Run an HTTP action; URL, form fields and file paths are templated.
pub async fn run_http(
    client: &reqwest::Client,
    action: &HttpSpec,
    ctx: &Value,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> ExecOutcome {
    tokio::select! {
        outcome = http_request(client, action, ctx, timeout) => outcome,
        _ = cancel.cancelled() => ExecOutcome::failed(String::new(), ExecError::Cancelled),
    }
}

async fn http_request(
    client: &reqwest::Client,
    action: &HttpSpec,
    ctx: &Value,
    timeout: Option<Duration>,
) -> ExecOutcome {
    let request = match build_request(client, action, ctx).await {
        Ok(r) => r,
        Err(e) => return ExecOutcome::failed(String::new(), e),
    };
    let request = match timeout {
        Some(d) => request.timeout(d),
        None => request,
    };

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            return ExecOutcome::failed(String::new(), ExecError::Timeout(timeout.unwrap_or_default()));
        }
        Err(e) => return ExecOutcome::failed(String::new(), e.into()),
    };

    let status = response.status();
    let mut dump = format!("{:?} {}\r\n", response.version(), status);
    for (name, value) in response.headers() {
        dump.push_str(&format!(
            "{}: {}\r\n",
            name,
            String::from_utf8_lossy(value.as_bytes())
        ));
    }
    dump.push_str("\r\n");
    match response.text().await {
        Ok(body) => dump.push_str(&body),
        Err(e) => return ExecOutcome::failed(dump, e.into()),
    }

    if status.is_success() {
        ExecOutcome::ok(dump)
    } else {
        ExecOutcome::failed(dump, ExecError::HttpStatus(status.as_u16()))
    }
}

async fn build_request(
    client: &reqwest::Client,
    action: &HttpSpec,
    ctx: &Value,
) -> Result<reqwest::RequestBuilder, ExecError> {
    let url = render(&action.url, ctx)?;
    match action.method.to_uppercase().as_str() {
        "GET" => Ok(client.get(url)),
        "POST" => {
            let mut form = Form::new();
            for file in &action.files {
                let path = render(&file.path, ctx)?;
                let contents = tokio::fs::read(&path)
                    .await
                    .map_err(|source| ExecError::File {
                        path: path.clone(),
                        source,
                    })?;
                let file_name = std::path::Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.filename.clone());
                form = form.part(file.filename.clone(), Part::bytes(contents).file_name(file_name));
            }
            for (key, value) in &action.data {
                form = form.text(key.clone(), render(value, ctx)?);
            }
            Ok(client.post(url).multipart(form))
        }
        other => Err(ExecError::UnsupportedMethod(other.to_string())),
    }
}
