//! Subprocess launch and incremental output capture.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::parser::{ParserConfig, ProgressParser, TrackerEvent};
use super::tokenizer::{RecordTokenizer, Separators};
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::engine::EngineCommand;
use crate::error::{QuantError, Result};

/// How often a blocked reader re-checks the cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A running engine process whose output is parsed into [`TrackerEvent`]s.
///
/// On unix stdout and stderr share a single pipe, so records arrive in the
/// order the child wrote them (llama-imatrix declares its total on stderr
/// and reports chunks on stdout). Elsewhere each stream gets its own reader.
/// Records flow through one bounded channel, so a slow consumer applies
/// back-pressure instead of buffering the whole stream.
pub struct TrackedProcess {
    program: String,
    child: Child,
    records: mpsc::Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    parser: ProgressParser,
    cancel: CancellationToken,
}

impl TrackedProcess {
    pub fn spawn(
        command: &EngineCommand,
        config: ParserConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        cancel.check()?;
        let program = command.program_name();
        debug!("Spawning {}", command);

        let spawn_error = |e: std::io::Error| QuantError::Spawn {
            program: program.clone(),
            message: e.to_string(),
        };

        let mut process = Command::new(command.program());
        process
            .args(command.args())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let (tx, rx) = mpsc::channel(EngineConfig::RECORD_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);

        #[cfg(unix)]
        let child = {
            let output = combined_output(&mut process).map_err(spawn_error)?;
            let child = process.spawn().map_err(spawn_error)?;
            // Our copies of the write end must close for the reader to see EOF.
            drop(process);
            readers.push(tokio::spawn(pump(output, config.separators, tx)));
            child
        };

        #[cfg(not(unix))]
        let child = {
            process.stdout(Stdio::piped()).stderr(Stdio::piped());
            let mut child = process.spawn().map_err(spawn_error)?;
            if let Some(stdout) = child.stdout.take() {
                readers.push(tokio::spawn(pump(stdout, config.separators, tx.clone())));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(tokio::spawn(pump(stderr, config.separators, tx.clone())));
            }
            drop(tx);
            child
        };

        Ok(Self {
            program,
            child,
            records: rx,
            readers,
            parser: ProgressParser::new(config),
            cancel,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Next classified record, or `None` once the output is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`QuantError::Cancelled`] after killing the child if the
    /// cancellation token was set.
    pub async fn next_event(&mut self) -> Result<Option<TrackerEvent>> {
        loop {
            if self.cancel.is_cancelled() {
                warn!("Cancelling {}", self.program);
                self.child.kill().await.ok();
                return Err(QuantError::Cancelled);
            }

            match tokio::time::timeout(CANCEL_POLL_INTERVAL, self.records.recv()).await {
                Ok(Some(record)) => return Ok(Some(self.parser.parse(&record))),
                Ok(None) => return Ok(None),
                Err(_) => continue,
            }
        }
    }

    /// Wait for exit and surface a non-zero status as [`QuantError::ProcessFailure`].
    ///
    /// Unread output is drained and discarded.
    pub async fn finish(mut self) -> Result<()> {
        while self.records.recv().await.is_some() {}
        let status = self.child.wait().await.map_err(|e| QuantError::Spawn {
            program: self.program.clone(),
            message: format!("waiting for exit: {e}"),
        })?;
        for reader in self.readers.drain(..) {
            reader.await.ok();
        }

        if status.success() {
            debug!("{} exited successfully", self.program);
            Ok(())
        } else {
            Err(QuantError::ProcessFailure {
                program: self.program,
                status: status.code(),
            })
        }
    }
}

/// Point the child's stdout and stderr at one pipe; returns its read end.
#[cfg(unix)]
fn combined_output(command: &mut Command) -> std::io::Result<tokio::net::unix::pipe::Receiver> {
    let (writer, reader) = tokio::net::unix::pipe::pipe()?;
    let stdout = writer.into_blocking_fd()?;
    let stderr = stdout.try_clone()?;
    command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
    Ok(reader)
}

/// Read `stream` in chunks and forward every completed record.
async fn pump<R>(mut stream: R, separators: Separators, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut tokenizer = RecordTokenizer::new(separators);
    let mut buf = vec![0u8; EngineConfig::READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for record in tokenizer.push(&buf[..n]) {
                    if tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Error reading subprocess output: {}", e);
                break;
            }
        }
    }

    if let Some(record) = tokenizer.finish() {
        tx.send(record).await.ok();
    }
}
