//! Splits a pseudo-terminal byte stream into progress lines.
//!
//! Progress meters such as `pv` redraw in place with a bare carriage return,
//! so both `\r` and `\n` terminate a line here. Lines that are blank after
//! trimming carry nothing and are skipped.
use std::io::{self, BufRead, BufReader, Read};

/// An iterator of trimmed, non-empty lines read from `R`.
///
/// Reading stops at end of stream. A read error also ends the stream: on Linux
/// the master side of a pty reports `EIO` once the last process holding the
/// slave has exited, which is the normal way these streams end.
pub struct ProgressLines<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    finished: bool,
}

impl<R: Read> ProgressLines<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
            finished: false,
        }
    }

    /// Reads until a line terminator or end of stream, appending to `pending`.
    /// Returns `true` when a complete line or a final fragment is available.
    fn fill_line(&mut self) -> bool {
        loop {
            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::trace!(error = %e, "progress stream ended with read error");
                    self.finished = true;
                    return !self.pending.is_empty();
                }
            };
            if available.is_empty() {
                self.finished = true;
                return !self.pending.is_empty();
            }
            match available.iter().position(|&b| b == b'\r' || b == b'\n') {
                Some(i) => {
                    self.pending.extend_from_slice(&available[..i]);
                    self.reader.consume(i + 1);
                    return true;
                }
                None => {
                    let n = available.len();
                    self.pending.extend_from_slice(available);
                    self.reader.consume(n);
                }
            }
        }
    }
}

impl<R: Read> Iterator for ProgressLines<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while !self.finished {
            if !self.fill_line() {
                break;
            }
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        None
    }
}
