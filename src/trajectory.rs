//! Re-encoding of textual trajectory frames into a flat `f32` coordinate stream.
//!
//! Input is either a pre-processed text file or the stdout of a dump command
//! (`gmx dump -f traj.xtc`). Two record kinds matter: frame markers and per-atom
//! coordinate lines. Every other line is ignored. Each coordinate is scaled
//! (nm to Å by default) and emitted as little-endian `f32`, three per atom,
//! frame-major, with no header or delimiter.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll, ready};

use camino::Utf8Path;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio::process::Command;
use tracing::debug;

use crate::domain::TrajectoryInfo;
use crate::error::IngestError;

pub const DEFAULT_FRAME_PATTERN: &str = r"^\S*\s*frame\s+\d+:";
pub const DEFAULT_COORDINATE_PATTERN: &str = r"^\s*x\[\s*\d+\]=\{\s*([-+0-9.eE]+),\s*([-+0-9.eE]+),\s*([-+0-9.eE]+)\s*\}";
pub const NM_TO_ANGSTROM: f32 = 10.0;

#[derive(Debug, Clone)]
pub struct TrajectoryPatterns {
    pub frame: Regex,
    pub coordinate: Regex,
    pub scale: f32,
}

impl Default for TrajectoryPatterns {
    fn default() -> Self {
        Self {
            frame: Regex::new(DEFAULT_FRAME_PATTERN).expect("default frame pattern is valid"),
            coordinate: Regex::new(DEFAULT_COORDINATE_PATTERN)
                .expect("default coordinate pattern is valid"),
            scale: NM_TO_ANGSTROM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Record {
    Frame,
    Atom([f32; 3]),
    Other,
}

impl TrajectoryPatterns {
    pub fn classify(&self, line: &str) -> Record {
        if self.frame.is_match(line) {
            return Record::Frame;
        }
        let Some(captures) = self.coordinate.captures(line) else {
            return Record::Other;
        };
        let scale = f64::from(self.scale);
        let mut xyz = [0f32; 3];
        for (slot, index) in xyz.iter_mut().zip(1..=3) {
            match captures
                .get(index)
                .and_then(|value| value.as_str().parse::<f64>().ok())
            {
                // Scaled in double precision, rounded to f32 once.
                Some(value) => *slot = (value * scale) as f32,
                None => return Record::Other,
            }
        }
        Record::Atom(xyz)
    }
}

type ExitCheck = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    Codec(String),
    Command(String),
}

/// Pull-based encoder: every `poll_read` decodes just enough lines to fill the
/// caller's buffer, so memory stays at one line plus one atom triple.
pub struct TrajectoryReader<R> {
    inner: R,
    patterns: TrajectoryPatterns,
    line: Vec<u8>,
    pending: [u8; 12],
    pending_pos: usize,
    frames: u64,
    coordinates: u64,
    exit_check: Option<ExitCheck>,
    finished: bool,
    failure: Option<Failure>,
    deferred: Option<io::Error>,
}

impl<R: AsyncBufRead + Unpin> TrajectoryReader<R> {
    pub fn new(inner: R, patterns: TrajectoryPatterns) -> Self {
        Self {
            inner,
            patterns,
            line: Vec::new(),
            pending: [0; 12],
            pending_pos: 12,
            frames: 0,
            coordinates: 0,
            exit_check: None,
            finished: false,
            failure: None,
            deferred: None,
        }
    }

    fn with_exit_check(mut self, check: ExitCheck) -> Self {
        self.exit_check = Some(check);
        self
    }

    /// Frame and atom counts; only meaningful once the stream reached EOF.
    pub fn info(&self) -> Result<TrajectoryInfo, IngestError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone().into());
        }
        summarize(self.frames, self.coordinates).map_err(IngestError::Codec)
    }

    /// Turns an upload error caused by this reader back into the decoding error.
    pub fn explain(&self, err: IngestError) -> IngestError {
        match &self.failure {
            Some(failure) => failure.clone().into(),
            None => err,
        }
    }

    fn fail(&mut self, failure: Failure) -> io::Error {
        let message = match &failure {
            Failure::Codec(message) | Failure::Command(message) => message.clone(),
        };
        self.failure = Some(failure);
        io::Error::new(io::ErrorKind::InvalidData, message)
    }

    /// Ends the stream with `err`. Bytes already placed in `buf` by this call are
    /// returned first and the error is reported on the next read.
    fn end_with(&mut self, err: io::Error, filled: bool) -> Poll<io::Result<()>> {
        self.finished = true;
        if filled {
            self.deferred = Some(err);
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(err))
        }
    }
}

impl From<Failure> for IngestError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Codec(message) => IngestError::Codec(message),
            Failure::Command(message) => IngestError::DumpCommand(message),
        }
    }
}

fn summarize(frames: u64, coordinates: u64) -> Result<TrajectoryInfo, String> {
    if frames == 0 {
        if coordinates > 0 {
            return Err(format!("{coordinates} coordinates found before any frame marker"));
        }
        return Ok(TrajectoryInfo { frames: 0, atoms: 0 });
    }
    if coordinates % frames != 0 {
        return Err(format!(
            "{coordinates} coordinates cannot be split evenly over {frames} frames"
        ));
    }
    Ok(TrajectoryInfo {
        frames,
        atoms: coordinates / frames,
    })
}

/// Reads one `\n`-terminated line into `line`. Yields `false` at EOF with nothing read.
fn poll_line<R: AsyncBufRead + Unpin>(
    inner: &mut R,
    line: &mut Vec<u8>,
    cx: &mut Context<'_>,
) -> Poll<io::Result<bool>> {
    loop {
        let available = ready!(Pin::new(&mut *inner).poll_fill_buf(cx))?;
        if available.is_empty() {
            return Poll::Ready(Ok(!line.is_empty()));
        }
        match available.iter().position(|byte| *byte == b'\n') {
            Some(end) => {
                line.extend_from_slice(&available[..=end]);
                Pin::new(&mut *inner).consume(end + 1);
                return Poll::Ready(Ok(true));
            }
            None => {
                let len = available.len();
                line.extend_from_slice(available);
                Pin::new(&mut *inner).consume(len);
            }
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for TrajectoryReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.deferred.take() {
            return Poll::Ready(Err(err));
        }
        let start = buf.filled().len();
        loop {
            if this.pending_pos < this.pending.len() {
                let take = buf.remaining().min(this.pending.len() - this.pending_pos);
                buf.put_slice(&this.pending[this.pending_pos..this.pending_pos + take]);
                this.pending_pos += take;
                if buf.remaining() == 0 {
                    return Poll::Ready(Ok(()));
                }
                continue;
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }

            let has_line = match poll_line(&mut this.inner, &mut this.line, cx) {
                Poll::Ready(Ok(has_line)) => has_line,
                Poll::Ready(Err(err)) => return this.end_with(err, buf.filled().len() > start),
                Poll::Pending if buf.filled().len() > start => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            };

            if !has_line {
                if let Some(check) = this.exit_check.as_mut() {
                    match check.as_mut().poll(cx) {
                        Poll::Pending if buf.filled().len() > start => {
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(message)) => {
                            this.exit_check = None;
                            let err = this.fail(Failure::Command(message));
                            return this.end_with(err, buf.filled().len() > start);
                        }
                        Poll::Ready(Ok(())) => this.exit_check = None,
                    }
                }
                if let Err(message) = summarize(this.frames, this.coordinates) {
                    let err = this.fail(Failure::Codec(message));
                    return this.end_with(err, buf.filled().len() > start);
                }
                this.finished = true;
                return Poll::Ready(Ok(()));
            }

            let record = match std::str::from_utf8(&this.line) {
                Ok(text) => this.patterns.classify(text.trim_end_matches(['\r', '\n'])),
                Err(_) => Record::Other,
            };
            this.line.clear();
            match record {
                Record::Frame => this.frames += 1,
                Record::Atom(xyz) => {
                    this.coordinates += 1;
                    for (chunk, value) in this.pending.chunks_exact_mut(4).zip(xyz) {
                        chunk.copy_from_slice(&value.to_le_bytes());
                    }
                    this.pending_pos = 0;
                }
                Record::Other => {}
            }
        }
    }
}

const STDERR_TAIL_LINES: usize = 5;

/// Reads `stream` to the end, keeping only its last `keep` non-empty lines.
async fn tail_lines<R: AsyncRead + Unpin>(stream: R, keep: usize) -> String {
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    let mut tail = VecDeque::with_capacity(keep);
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            continue;
        }
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Opens a pre-processed text trajectory.
pub async fn open_text(
    path: &Utf8Path,
    patterns: TrajectoryPatterns,
) -> Result<TrajectoryReader<BufReader<tokio::fs::File>>, IngestError> {
    let file = tokio::fs::File::open(path.as_std_path())
        .await
        .map_err(|err| IngestError::Filesystem(format!("open {path}: {err}")))?;
    Ok(TrajectoryReader::new(BufReader::new(file), patterns))
}

/// Spawns `command` (with `{input}` replaced by `path`) and decodes its stdout.
///
/// The process is killed if the reader is dropped early. A non-zero exit turns
/// into an error at the end of the stream, before the upload is committed.
pub fn open_dump(
    command: &[String],
    path: &Utf8Path,
    patterns: TrajectoryPatterns,
) -> Result<TrajectoryReader<BufReader<tokio::process::ChildStdout>>, IngestError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| IngestError::DumpCommand("empty dump command".to_string()))?;
    let args: Vec<String> = args
        .iter()
        .map(|arg| arg.replace("{input}", path.as_str()))
        .collect();
    debug!(program = %program, args = ?args, "spawning trajectory dump");

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| IngestError::DumpCommand(format!("{program}: {err}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| IngestError::DumpCommand("dump command has no stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| IngestError::DumpCommand("dump command has no stderr".to_string()))?;
    // Drained concurrently so a chatty command never blocks on a full pipe.
    let stderr_tail = tokio::spawn(tail_lines(stderr, STDERR_TAIL_LINES));

    let program = program.clone();
    let check: ExitCheck = Box::pin(async move {
        let status = child
            .wait()
            .await
            .map_err(|err| format!("{program}: {err}"))?;
        let tail = stderr_tail.await.unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        Err(if tail.is_empty() {
            format!("{program} exited with {status}")
        } else {
            format!("{program} exited with {status}: {tail}")
        })
    });

    Ok(TrajectoryReader::new(BufReader::new(stdout), patterns).with_exit_check(check))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    const DUMP: &str = "traj.xtc frame 0:
   natoms=         3  step=         0  time=0.0000000e+00  prec=      1000
   box (3x3):
      box[    0]={ 5.00000e+00,  0.00000e+00,  0.00000e+00}
   x (3x3):
      x[    0]={ 1.00000e+00,  2.00000e+00,  3.00000e+00}
      x[    1]={ 1.00000e+00,  2.00000e+00,  3.00000e+00}
      x[    2]={ 1.00000e+00,  2.00000e+00,  3.00000e+00}
";

    #[test]
    fn classify_records() {
        let patterns = TrajectoryPatterns::default();
        assert_eq!(patterns.classify("traj.xtc frame 12:"), Record::Frame);
        assert_eq!(
            patterns.classify("      box[    0]={ 5.00000e+00,  0.00000e+00,  0.00000e+00}"),
            Record::Other
        );
        assert_eq!(
            patterns.classify("   x[    7]={-2.50000e-01,  2.00000e+00,  3.00000e+00}"),
            Record::Atom([-2.5, 20.0, 30.0])
        );
        assert_eq!(patterns.classify("# comment"), Record::Other);
    }

    #[tokio::test]
    async fn encodes_scaled_little_endian_floats() {
        let mut reader = TrajectoryReader::new(DUMP.as_bytes(), TrajectoryPatterns::default());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out.len(), 3 * 3 * 4);
        let values: Vec<f32> = out
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![10.0, 20.0, 30.0, 10.0, 20.0, 30.0, 10.0, 20.0, 30.0]);
        assert_eq!(reader.info().unwrap(), TrajectoryInfo { frames: 1, atoms: 3 });
    }

    #[tokio::test]
    async fn uneven_frames_fail_at_eof() {
        let input = format!(
            "{DUMP}traj.xtc frame 1:\n      x[    0]={{ 1.0, 2.0, 3.0}}\n      x[    1]={{ 1.0, 2.0, 3.0}}\n"
        );
        let mut reader = TrajectoryReader::new(input.as_bytes(), TrajectoryPatterns::default());
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
        assert!(matches!(reader.info(), Err(IngestError::Codec(_))));
    }

    #[test]
    fn coordinates_are_rounded_to_f32_once() {
        let patterns = TrajectoryPatterns::default();
        let Record::Atom(xyz) = patterns.classify("   x[    0]={ 4.000407, 0.1, -3.3}") else {
            panic!("expected an atom record");
        };
        assert_eq!(xyz[0], (4.000407_f64 * 10.0) as f32);
        assert_eq!(&xyz[1..], &[1.0, -33.0]);
        assert_ne!(xyz[0], 4.000407_f32 * 10.0);
    }

    #[tokio::test]
    async fn bytes_before_a_late_error_are_delivered_first() {
        let input = format!(
            "{DUMP}traj.xtc frame 1:\n      x[    0]={{ 1.0, 2.0, 3.0}}\n      x[    1]={{ 1.0, 2.0, 3.0}}\n"
        );
        let mut reader = TrajectoryReader::new(input.as_bytes(), TrajectoryPatterns::default());
        let mut buf = [0u8; 64];

        assert_eq!(reader.read(&mut buf).await.unwrap(), 5 * 12);
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(reader.info(), Err(IngestError::Codec(_))));
    }

    #[tokio::test]
    async fn tiny_reads_still_see_every_byte() {
        let mut reader = TrajectoryReader::new(DUMP.as_bytes(), TrajectoryPatterns::default());
        let mut out = Vec::new();
        let mut byte = [0u8; 5];
        loop {
            let read = reader.read(&mut byte).await.unwrap();
            if read == 0 {
                break;
            }
            out.extend_from_slice(&byte[..read]);
        }
        assert_eq!(out.len(), 36);
        assert_eq!(f32::from_le_bytes(out[32..36].try_into().unwrap()), 30.0);
    }
}
