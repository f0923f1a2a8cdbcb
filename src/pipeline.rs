//! # Sensor Pipeline
//!
//! Three stages decoupled by two queues:
//!
//! ```text
//!   input file ──► sensor ──► queue_sensor ──► processing ──► queue_processing ──► storage ──► output file
//!                 periodic                    window of 5                          append
//!                 one line                    rounded mean
//!                 per period
//! ```
//!
//! Only the sensor is periodic; it simulates a live feed by releasing one
//! input line per activation. Processing and storage are queue-driven and
//! run as fast as their input allows, throttled only by backpressure.
//!
//! End of stream flows downstream: whoever stops closes its output queue,
//! and the next stage drains what is left and stops in turn. A stage that
//! stops early, on an error or because its own output was closed, also
//! closes its input, so the stage feeding it gets `QueueClosed` instead of
//! blocking on a full queue.
//!
//! Malformed numeric tokens are skipped with a warning; they never enter
//! the window.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, LineWriter, Write};
use std::ops::ControlFlow;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::WINDOW_SIZE;
use crate::error::{HarnessError, Result};
use crate::queue::QueueHandle;
use crate::scheduler::{PeriodicScheduler, PeriodicWait};
use crate::sync::ShutdownToken;
use crate::task::ActivationRecord;

// ---------------------------------------------------------------------------
// Input feed
// ---------------------------------------------------------------------------

/// Line reader with a persistent cursor. Owned by the sensor task only.
pub struct SensorFeed<R> {
    reader: R,
    lines_read: u64,
    exhausted: bool,
}

impl SensorFeed<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> SensorFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            lines_read: 0,
            exhausted: false,
        }
    }

    /// Next unread line without its line terminator, or `None` at end of
    /// input.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        self.lines_read += 1;
        Ok(Some(line))
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

// ---------------------------------------------------------------------------
// Windowed aggregation
// ---------------------------------------------------------------------------

/// Sliding window of the most recent integer samples.
#[derive(Debug, Clone)]
pub struct WindowAverager {
    window: VecDeque<i64>,
    size: usize,
    skipped: u64,
}

impl Default for WindowAverager {
    fn default() -> Self {
        Self::new(WINDOW_SIZE)
    }
}

impl WindowAverager {
    /// A window of `size` samples. A zero size is treated as one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            window: VecDeque::with_capacity(size),
            size,
            skipped: 0,
        }
    }

    /// Parse a token and push it. Malformed tokens are counted and skipped.
    pub fn push(&mut self, token: &str) -> Option<i64> {
        match token.trim().parse::<i64>() {
            Ok(value) => self.push_value(value),
            Err(e) => {
                self.skipped += 1;
                warn!(token, error = %e, "skipping malformed sample");
                None
            }
        }
    }

    /// Push a sample. Once the window is full, returns the rounded mean of
    /// the last `size` samples (halves round away from zero).
    pub fn push_value(&mut self, value: i64) -> Option<i64> {
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        if self.window.len() < self.size {
            return None;
        }
        let sum: i128 = self.window.iter().map(|&v| v as i128).sum();
        Some((sum as f64 / self.size as f64).round() as i64)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// Line-oriented result file.
pub struct ResultSink<W: Write> {
    writer: W,
    written: u64,
}

impl ResultSink<LineWriter<File>> {
    /// Create or truncate the output file.
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self::new(LineWriter::new(File::create(path)?)))
    }
}

impl<W: Write> ResultSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{line}")?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Periodic producer: one input line per activation onto `output`.
///
/// At end of input the sensor either closes `output` and stops
/// (`stop_at_end_of_input`) or keeps its period idling until shutdown.
pub fn sensor_stage<W, R>(
    scheduler: &mut PeriodicScheduler<W>,
    shutdown: &ShutdownToken,
    feed: &mut SensorFeed<R>,
    output: &QueueHandle,
    stop_at_end_of_input: bool,
) -> Result<ActivationRecord>
where
    W: PeriodicWait,
    R: BufRead,
{
    let result = scheduler.run(shutdown, |activation| {
        let Some(line) = feed.next_line()? else {
            if stop_at_end_of_input {
                info!(lines = feed.lines_read(), "input exhausted, closing stream");
                return Ok(ControlFlow::Break(()));
            }
            if activation.index == feed.lines_read() + 1 {
                info!(lines = feed.lines_read(), "input exhausted, idling");
            }
            return Ok(ControlFlow::Continue(()));
        };

        debug!(activation = activation.index, line = %line, "sample released");
        match output.send(line) {
            Ok(()) => Ok(ControlFlow::Continue(())),
            Err(HarnessError::QueueClosed(_)) => Ok(ControlFlow::Break(())),
            Err(e) => Err(e),
        }
    });
    output.close();
    result
}

/// Queue-driven aggregator: samples from `input`, rounded window means to
/// `output`. Returns the number of means emitted.
pub fn processing_stage(
    input: &QueueHandle,
    output: &QueueHandle,
    averager: &mut WindowAverager,
) -> Result<u64> {
    let mut emitted = 0;
    let result = loop {
        let Some(message) = input.receive() else {
            break Ok(emitted);
        };
        let Some(token) = message.as_text() else {
            warn!(bytes = message.len(), "skipping non-UTF-8 sample");
            continue;
        };
        let Some(mean) = averager.push(token) else {
            continue;
        };

        debug!(mean, "window mean");
        match output.send(mean.to_string()) {
            Ok(()) => emitted += 1,
            Err(HarnessError::QueueClosed(_)) => break Ok(emitted),
            Err(e) => break Err(e),
        }
    };
    input.close();
    output.close();
    info!(emitted, skipped = averager.skipped(), "processing stream ended");
    result
}

/// Queue-driven writer: each message from `input` becomes one output line.
/// Returns the number of lines written.
pub fn storage_stage<W: Write>(input: &QueueHandle, sink: &mut ResultSink<W>) -> Result<u64> {
    let result = loop {
        let Some(message) = input.receive() else {
            break sink.flush();
        };
        let text = String::from_utf8_lossy(message.as_bytes());
        if let Err(e) = sink.write_line(&text) {
            break Err(e);
        }
    };
    input.close();
    result?;
    info!(written = sink.written(), "storage stream ended");
    Ok(sink.written())
}
