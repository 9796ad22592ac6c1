//! Command runner: renders command templates and runs them on one host
//!
//! Templates are minijinja with strict undefined handling, so a missing
//! parameter fails before anything reaches the host. In verbose mode every
//! output line is also emitted as a tracing event tagged with the host.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_common::{Error, Result};

use crate::executor::{Connection, ExecOutput, StreamIo};

/// Render a command template against `params`
pub fn render<S: Serialize>(template: &str, params: S) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    Ok(env.render_str(template, params)?)
}

/// Runs rendered commands over one host's connection
#[derive(Clone)]
pub struct Runner {
    conn: Arc<dyn Connection>,
    verbose: bool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("host", &self.conn.host())
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl Runner {
    /// A runner over `conn`, abandoning commands when `cancel` fires
    pub fn new(conn: Arc<dyn Connection>, verbose: bool, cancel: CancellationToken) -> Self {
        Self {
            conn,
            verbose,
            cancel,
        }
    }

    /// Host this runner talks to
    pub fn host(&self) -> &str {
        self.conn.host()
    }

    /// The underlying connection (for tunnels)
    pub fn connection(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    /// Cancellation signal commands run under
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Tee command output to the log
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Render `template` with `params` and run it; non-zero exit is an error
    pub async fn run<S: Serialize>(&self, template: &str, params: S) -> Result<ExecOutput> {
        let command = render(template, params)?;
        self.run_raw(&command).await
    }

    /// Run a literal command; non-zero exit is an error
    pub async fn run_raw(&self, command: &str) -> Result<ExecOutput> {
        let out = self.output(command).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(Error::CommandFailed {
                host: self.host().to_string(),
                command: command.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Run a literal command and return its output whatever the exit code
    pub async fn output(&self, command: &str) -> Result<ExecOutput> {
        debug!(host = %self.host(), command = %command, "exec");

        if !self.verbose {
            return self.conn.exec(command, &self.cancel).await;
        }

        let mut stdout = LineTee::new(self.host(), "stdout");
        let mut stderr = LineTee::new(self.host(), "stderr");
        let exit_code = self
            .conn
            .stream(
                command,
                StreamIo {
                    stdin: None,
                    stdout: &mut stdout,
                    stderr: &mut stderr,
                },
                &self.cancel,
            )
            .await?;

        Ok(ExecOutput {
            stdout: stdout.finish(),
            stderr: stderr.finish(),
            exit_code,
        })
    }

    /// Write `contents` to `path` on the host with the given octal `mode`
    pub async fn upload(&self, contents: &[u8], path: &str, mode: &str) -> Result<()> {
        let command = render(
            "mkdir -p \"$(dirname '{{ path }}')\" && cat > '{{ path }}' && chmod {{ mode }} '{{ path }}'",
            minijinja::context! { path, mode },
        )?;
        let mut stdin = contents;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = self
            .conn
            .stream(
                &command,
                StreamIo {
                    stdin: Some(&mut stdin),
                    stdout: &mut stdout,
                    stderr: &mut stderr,
                },
                &self.cancel,
            )
            .await?;
        if code != 0 {
            return Err(Error::CommandFailed {
                host: self.host().to_string(),
                command,
                exit_code: code,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        debug!(host = %self.host(), path = %path, bytes = contents.len(), "uploaded file");
        Ok(())
    }

    /// Read `path` from the host byte for byte
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let command = render("cat '{{ path }}'", minijinja::context! { path })?;
        self.capture(&command).await
    }

    /// Run a literal command and return its stdout byte for byte
    ///
    /// Never tee'd, so binary output and key material stay out of the logs.
    pub async fn capture(&self, command: &str) -> Result<Vec<u8>> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = self
            .conn
            .stream(
                command,
                StreamIo {
                    stdin: None,
                    stdout: &mut stdout,
                    stderr: &mut stderr,
                },
                &self.cancel,
            )
            .await?;
        if code != 0 {
            return Err(Error::CommandFailed {
                host: self.host().to_string(),
                command: command.to_string(),
                exit_code: code,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

/// Captures a stream while emitting each complete line as a tracing event
struct LineTee {
    host: String,
    stream: &'static str,
    captured: Vec<u8>,
    line_start: usize,
}

impl LineTee {
    fn new(host: &str, stream: &'static str) -> Self {
        Self {
            host: host.to_string(),
            stream,
            captured: Vec::new(),
            line_start: 0,
        }
    }

    fn emit_complete_lines(&mut self) {
        while let Some(pos) = self.captured[self.line_start..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let end = self.line_start + pos;
            let line = String::from_utf8_lossy(&self.captured[self.line_start..end]);
            info!(host = %self.host, stream = self.stream, "{}", line);
            self.line_start = end + 1;
        }
    }

    fn finish(mut self) -> String {
        self.emit_complete_lines();
        if self.line_start < self.captured.len() {
            let rest = String::from_utf8_lossy(&self.captured[self.line_start..]);
            info!(host = %self.host, stream = self.stream, "{}", rest);
        }
        String::from_utf8_lossy(&self.captured).into_owned()
    }
}

impl AsyncWrite for LineTee {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.captured.extend_from_slice(buf);
        self.emit_complete_lines();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
