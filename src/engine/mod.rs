mod estimate;
mod interpreter;
pub mod protocol;

use crate::model::{Lane, LaneEvent, LaneResult, RunnerConfig};
use estimate::ProgressEstimator;
use protocol::{LineEvent, StreamSummary};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Everything that can go wrong in one lane. Rendered into the lane's error
/// message; never propagated past the lane task.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("No usable interpreter found (tried: {tried})")]
    NoInterpreter { tried: String },
    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed while waiting for worker: {0}")]
    Wait(#[source] std::io::Error),
    #[error("worker failed with {status}.{}", .hint.map(|h| format!(" {h}")).unwrap_or_default())]
    Exited {
        status: String,
        hint: Option<&'static str>,
    },
    #[error("Failed to parse JSON output from worker. Error: {0}")]
    InvalidResult(#[source] serde_json::Error),
    #[error("{0}")]
    Application(String),
    #[error("terminated by request")]
    Terminated,
    #[error("worker pool is closed")]
    PoolClosed,
}

/// A worker invocation for one lane.
#[derive(Debug, Clone)]
pub struct LaneCommand {
    pub lane: Lane,
    pub script: PathBuf,
    pub args: Vec<String>,
}

/// Runs one external worker process and turns its output into lane events.
pub struct WorkerHarness {
    interpreters: Vec<String>,
    progress_grace: Duration,
    heartbeat_interval: Duration,
    expected_runtime: Duration,
    progress_cap: f64,
}

impl WorkerHarness {
    pub fn new(cfg: &RunnerConfig) -> Self {
        Self {
            interpreters: cfg.interpreters.clone(),
            progress_grace: cfg.progress_grace,
            heartbeat_interval: cfg.heartbeat_interval.max(MIN_HEARTBEAT),
            expected_runtime: cfg.expected_runtime,
            progress_cap: cfg.heuristic_progress_cap,
        }
    }

    /// Run the worker to completion.
    ///
    /// Progress is sent on `event_tx` as it arrives; the terminal outcome is the
    /// return value, so the caller decides how to report it exactly once.
    pub async fn run(
        &self,
        cmd: LaneCommand,
        event_tx: &mpsc::UnboundedSender<LaneEvent>,
        cancel: &CancellationToken,
    ) -> Result<LaneResult, HarnessError> {
        let lane = cmd.lane;
        let interpreter = interpreter::resolve_interpreter(&self.interpreters)
            .await
            .ok_or_else(|| HarnessError::NoInterpreter {
                tried: self.interpreters.join(", "),
            })?;

        // Workers run from their own directory so they can find sibling files.
        let mut command = Command::new(&interpreter);
        match (
            cmd.script.parent().filter(|d| !d.as_os_str().is_empty()),
            cmd.script.file_name(),
        ) {
            (Some(dir), Some(file)) => {
                command.current_dir(dir).arg(file);
            }
            _ => {
                command.arg(&cmd.script);
            }
        }
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            %lane,
            interpreter = %interpreter.display(),
            script = %cmd.script.display(),
            "starting worker"
        );
        let mut child = command.spawn().map_err(HarnessError::Spawn)?;

        // stdout and stderr are merged into a single line stream.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<WorkerLine>();
        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(out, line_tx.clone(), protocol::MAX_LINE_BYTES));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(err, line_tx.clone(), protocol::MAX_LINE_BYTES));
        }
        drop(line_tx);

        let started = Instant::now();
        let mut estimator =
            ProgressEstimator::new(self.progress_grace, self.expected_runtime, self.progress_cap);
        let mut summary = StreamSummary::default();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(kill(&mut child, lane).await);
                }
                line = line_rx.recv() => {
                    let Some(line) = line else { break };
                    let event = match line {
                        WorkerLine::Text(text) => {
                            tracing::debug!(%lane, line = %text, "worker output");
                            protocol::parse_line(&text)
                        }
                        WorkerLine::Oversized(bytes) => {
                            tracing::warn!(%lane, bytes, "worker output line too long, discarded");
                            protocol::oversized_line(bytes)
                        }
                    };
                    summary.observe(&event);
                    if let LineEvent::Progress { lane: tagged, percent, eta_seconds } = event {
                        if tagged == lane {
                            estimator.mark_real_progress();
                            let _ = event_tx.send(LaneEvent::Progress { lane, percent, eta_seconds });
                        } else {
                            tracing::debug!(%lane, %tagged, "ignoring progress for another lane");
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some((percent, eta_seconds)) = estimator.estimate(started.elapsed()) {
                        let _ = event_tx.send(LaneEvent::Progress { lane, percent, eta_seconds });
                    }
                }
            }
        }

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = waited else {
            return Err(kill(&mut child, lane).await);
        };
        let status = status.map_err(HarnessError::Wait)?;
        tracing::info!(
            %lane,
            exit_code = ?status.code(),
            lines = summary.lines(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "worker exited"
        );

        interpret_exit(status, &summary)
    }
}

/// Turn an exit status plus what was seen on the stream into a lane outcome.
fn interpret_exit(status: ExitStatus, summary: &StreamSummary) -> Result<LaneResult, HarnessError> {
    match summary.final_result() {
        Some(json) if status.success() => parse_payload(json),
        final_result => {
            let hint = match (summary.marker(), final_result) {
                (Some(marker), _) => Some(marker.hint()),
                (None, None) => Some("No valid JSON output found."),
                (None, Some(_)) => None,
            };
            Err(HarnessError::Exited {
                status: describe_status(status),
                hint,
            })
        }
    }
}

/// Parse a worker's result payload, honouring the `{"error": ...}` form.
pub(crate) fn parse_payload(json: &str) -> Result<LaneResult, HarnessError> {
    let root: serde_json::Value = serde_json::from_str(json).map_err(HarnessError::InvalidResult)?;
    if let Some(err) = root.get("error") {
        let message = err
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| err.to_string());
        return Err(HarnessError::Application(message));
    }
    Ok(LaneResult::from_json(&root))
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

async fn kill(child: &mut Child, lane: Lane) -> HarnessError {
    tracing::warn!(%lane, "terminating worker");
    if let Err(e) = child.kill().await {
        tracing::warn!(%lane, error = %e, "failed to kill worker");
    }
    HarnessError::Terminated
}

/// One line read from a worker pipe.
#[derive(Debug, PartialEq)]
enum WorkerLine {
    Text(String),
    /// A line longer than the cap; only its length is kept.
    Oversized(usize),
}

/// Forward lines from one pipe, decoding lossily so stray bytes never end the
/// stream. At most `max_len` bytes of a line are buffered; the rest of an
/// overlong line is drained and dropped.
async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<WorkerLine>, max_len: usize)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "worker pipe closed with error");
                break;
            }
        };
        if chunk.is_empty() {
            if !buf.is_empty() || dropped > 0 {
                let _ = tx.send(finish_line(&mut buf, &mut dropped));
            }
            break;
        }
        let (take, line_done) = match chunk.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (chunk.len(), false),
        };
        // One extra byte of room for the terminator.
        let keep = (max_len + 1).saturating_sub(buf.len()).min(take);
        buf.extend_from_slice(&chunk[..keep]);
        dropped += take - keep;
        reader.consume(take);
        if line_done && tx.send(finish_line(&mut buf, &mut dropped)).is_err() {
            break;
        }
    }
}

fn finish_line(buf: &mut Vec<u8>, dropped: &mut usize) -> WorkerLine {
    let line = if *dropped > 0 {
        WorkerLine::Oversized(buf.len() + *dropped)
    } else {
        let text = String::from_utf8_lossy(buf);
        WorkerLine::Text(text.trim_end_matches(['\n', '\r']).to_string())
    };
    buf.clear();
    *dropped = 0;
    line
}
