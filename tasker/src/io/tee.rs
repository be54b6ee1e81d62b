//! Line-oriented tee from one source stream to several sinks.
//!
//! Each source gets its own thread, so a child's stdout and stderr drain
//! independently. Lines are written to every sink in source order; a slow sink
//! applies backpressure but never causes lines to be dropped.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::warn;

/// Writer shared between tee threads (e.g. one log file fed by stdout and stderr).
///
/// Each `write_all` of a line happens under the lock, so lines from different
/// sources never interleave mid-line.
pub struct SharedSink<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> SharedSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn handle(&self) -> Arc<Mutex<W>> {
        Arc::clone(&self.inner)
    }
}

impl<W> Clone for SharedSink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Write> Write for SharedSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("shared sink lock poisoned"))?;
        guard.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("shared sink lock poisoned"))?;
        guard.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("shared sink lock poisoned"))?;
        guard.flush()
    }
}

pub type Sink = Box<dyn Write + Send>;

/// Counters reported when a tee thread finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeeStats {
    pub lines: usize,
    pub bytes: usize,
}

/// Running tee thread. Join it to know the source has been fully copied.
pub struct TeeHandle {
    label: String,
    handle: JoinHandle<Result<TeeStats>>,
}

impl TeeHandle {
    pub fn join(self) -> Result<TeeStats> {
        match self.handle.join() {
            Ok(result) => result.with_context(|| format!("tee {}", self.label)),
            Err(_) => Err(anyhow!("tee thread {} panicked", self.label)),
        }
    }
}

/// Start copying `source` to every sink on a dedicated thread.
pub fn spawn_tee<R>(label: &str, source: R, sinks: Vec<Sink>) -> Result<TeeHandle>
where
    R: Read + Send + 'static,
{
    if sinks.is_empty() {
        return Err(anyhow!("tee {label} needs at least one sink"));
    }
    let thread_label = label.to_string();
    let handle = thread::Builder::new()
        .name(format!("tee-{label}"))
        .spawn(move || copy_lines(&thread_label, source, sinks))
        .with_context(|| format!("spawn tee thread {label}"))?;
    Ok(TeeHandle {
        label: label.to_string(),
        handle,
    })
}

fn copy_lines<R: Read>(label: &str, source: R, mut sinks: Vec<Sink>) -> Result<TeeStats> {
    let mut reader = BufReader::new(source);
    let mut stats = TeeStats::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        for sink in &mut sinks {
            sink.write_all(&line).context("write line")?;
            if let Err(err) = sink.flush() {
                warn!(tee = label, err = %err, "failed to flush tee sink");
            }
        }
        stats.lines += 1;
        stats.bytes += n;
    }
    Ok(stats)
}
