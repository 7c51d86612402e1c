//! Log tailer
//!
//! Follows a job's log file while its container runs, publishing each new
//! complete line (converted to HTML) to the job's log channel. If the build
//! stops producing output for longer than the stall timeout, the tailer
//! writes a notice into the log and kills the container.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_store::LogHub;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ansi;
use crate::podman::ContainerRuntime;

pub const STALL_MESSAGE: &str = "Sorry, your script has stalled and been killed.\n";

/// How a tailer run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailOutcome {
    /// The builder signalled completion and all output was flushed
    Finished,
    /// Output stalled and the container was killed
    Stalled,
}

#[derive(Debug, Clone, Copy)]
pub struct TailerSettings {
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    /// Bound on waiting for the builder to report its container
    pub handoff_timeout: Duration,
}

/// Incremental reader over a growing file
struct LogReader {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LogReader {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// Reads everything appended since the last call
    ///
    /// # Returns
    /// Complete lines, converted and newline-terminated, plus the number of
    /// new bytes seen. A missing file reads as empty.
    async fn poll(&mut self) -> std::io::Result<(Vec<String>, usize)> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf).await?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            lines.push(convert(&line[..line.len() - 1]));
        }

        Ok((lines, read))
    }

    /// Returns the held-back partial line, if any
    fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.partial);
        Some(convert(&line))
    }

    /// Appends text to the file
    ///
    /// The offset is left alone: a later `poll` reads the text back along
    /// with anything written before it that was not read yet.
    async fn append(&self, text: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }
}

fn convert(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut line = ansi::to_html(text.strip_suffix('\r').unwrap_or(&text));
    line.push('\n');
    line
}

/// Follows one job's log file
pub struct Tailer {
    reader: LogReader,
    channel: String,
    hub: Arc<dyn LogHub>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: TailerSettings,
}

impl Tailer {
    /// # Arguments
    /// * `log_path` - File the container appends its output to; may not exist yet
    /// * `channel` - Log channel the converted lines are published to
    pub fn new(
        log_path: PathBuf,
        channel: String,
        hub: Arc<dyn LogHub>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: TailerSettings,
    ) -> Self {
        Self {
            reader: LogReader::new(log_path),
            channel,
            hub,
            runtime,
            settings,
        }
    }

    /// Tails until `finished` is cancelled or the build stalls
    ///
    /// Container ids arrive on `handoff`, one per container the job runs;
    /// the tailer watches the most recent one. Output is published while
    /// waiting, but the stall clock only starts once a container is known.
    /// If no id arrives within the handoff timeout, the file is still
    /// followed but nothing is ever killed.
    pub async fn run(
        mut self,
        mut handoff: mpsc::Receiver<String>,
        finished: CancellationToken,
    ) -> TailOutcome {
        let mut ticker = time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handoff_deadline = time::sleep(self.settings.handoff_timeout);
        tokio::pin!(handoff_deadline);
        let mut awaiting_first = true;
        let mut listening = true;
        let mut stall_detection = true;

        let mut container: Option<String> = None;
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = finished.cancelled() => {
                    self.drain().await;
                    return TailOutcome::Finished;
                }

                received = handoff.recv(), if listening => match received {
                    Some(id) => {
                        awaiting_first = false;
                        if stall_detection {
                            debug!(container = %id, channel = %self.channel, "Tailer attached to container");
                            container = Some(id);
                            last_activity = Instant::now();
                        }
                    }
                    None => {
                        listening = false;
                        if awaiting_first {
                            awaiting_first = false;
                            debug!(channel = %self.channel, "Builder ended without a container");
                        }
                    }
                },

                _ = &mut handoff_deadline, if awaiting_first => {
                    awaiting_first = false;
                    stall_detection = false;
                    warn!(
                        channel = %self.channel,
                        "No container reported within {:?}; stall detection disabled",
                        self.settings.handoff_timeout
                    );
                }

                _ = ticker.tick() => {
                    if self.poll_once().await > 0 {
                        last_activity = Instant::now();
                    }

                    if let Some(id) = &container {
                        if last_activity.elapsed() >= self.settings.stall_timeout {
                            self.stall(id).await;
                            return TailOutcome::Stalled;
                        }
                    }
                }
            }
        }
    }

    /// Reads and publishes new lines; returns the number of new bytes
    async fn poll_once(&mut self) -> usize {
        match self.reader.poll().await {
            Ok((lines, read)) => {
                self.publish(&lines).await;
                read
            }
            Err(e) => {
                warn!(channel = %self.channel, "Failed to read log file: {}", e);
                0
            }
        }
    }

    /// Publishes whatever is left, including a trailing partial line
    async fn drain(&mut self) {
        self.poll_once().await;
        if let Some(line) = self.reader.flush() {
            self.publish(&[line]).await;
        }
    }

    async fn stall(&mut self, container: &str) {
        info!(
            container,
            channel = %self.channel,
            "No output for {:?}, killing container",
            self.settings.stall_timeout
        );

        // Anything written or held back so far belongs before the notice
        self.poll_once().await;
        let mut notice = STALL_MESSAGE.to_string();
        if let Some(line) = self.reader.flush() {
            self.publish(&[line]).await;
            notice.insert(0, '\n');
        }

        if let Err(e) = self.reader.append(&notice).await {
            warn!(channel = %self.channel, "Failed to record stall in log file: {}", e);
        }
        self.publish(&[STALL_MESSAGE.to_string()]).await;

        if let Err(e) = self.runtime.kill(container).await {
            warn!(container, "Failed to kill stalled container: {:#}", e);
        }
    }

    async fn publish(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        if let Err(e) = self.hub.publish(&self.channel, lines).await {
            warn!(channel = %self.channel, "Failed to publish {} log line(s): {}", lines.len(), e);
        }
    }
}
