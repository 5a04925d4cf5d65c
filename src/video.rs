use crate::error::Error;
use num_traits::ToPrimitive;
use serde::Deserialize;
use std::{
    ffi::OsString,
    fs,
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};
use tracing::{debug, info, warn};

/// Raw frames travel between processes as packed 8-bit BGR.
const RAW_PIX_FMT: &str = "bgr24";
const BYTES_PER_PIXEL: usize = 3;

/// One decoded frame in packed bgr24.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub(crate) index: usize,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) data: Vec<u8>,
}

fn frame_len(width: u32, height: u32) -> Result<usize, Error> {
    let width = width.to_usize().ok_or(Error::ConvertToUSize)?;
    let height = height.to_usize().ok_or(Error::ConvertToUSize)?;
    Ok(width * height * BYTES_PER_PIXEL)
}

impl Frame {
    #[cfg(test)]
    pub(crate) fn empty(index: usize) -> Self {
        Self {
            index,
            width: 0,
            height: 0,
            data: Vec::new(),
        }
    }
}

/// Produces frames in presentation order until the stream ends.
pub(crate) trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error>;
}

/// Consumes frames in the order they are given.
pub(crate) trait FrameSink {
    fn write(&mut self, frame: &Frame) -> Result<(), Error>;
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: String,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: ProbeFormat,
}

/// What the encoder needs to know to re-mux a source video.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VideoInfo {
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// As ffprobe reports it, e.g. `30000/1001`; ffmpeg accepts it verbatim.
    pub(crate) frame_rate: String,
    pub(crate) pix_fmt: String,
    pub(crate) codec: String,
    /// First name of the container format, e.g. `mov` for `mov,mp4,m4a,...`.
    pub(crate) format: String,
}

impl VideoInfo {
    fn from_probe_json(json: &[u8], path: &Path) -> Result<Self, Error> {
        let output: ProbeOutput =
            serde_json::from_slice(json).map_err(|e| Error::ParseProbe(e, path.to_path_buf()))?;
        let stream = output
            .streams
            .into_iter()
            .find(|stream| stream.codec_type == "video")
            .ok_or_else(|| Error::NoVideoStream(path.to_path_buf()))?;

        let field = |name| Error::ProbeField(name, path.to_path_buf());
        Ok(Self {
            width: stream.width.ok_or_else(|| field("width"))?,
            height: stream.height.ok_or_else(|| field("height"))?,
            frame_rate: stream.avg_frame_rate.ok_or_else(|| field("avg_frame_rate"))?,
            pix_fmt: stream.pix_fmt.ok_or_else(|| field("pix_fmt"))?,
            codec: stream.codec_name.ok_or_else(|| field("codec_name"))?,
            format: output
                .format
                .format_name
                .split(',')
                .next()
                .unwrap_or_default()
                .to_owned(),
        })
    }

    /// Frames per second, when the rate is known.
    pub(crate) fn frame_rate_hz(&self) -> Option<f64> {
        let mut parts = self.frame_rate.splitn(2, '/');
        let num = parts.next()?.trim().parse::<f64>().ok()?;
        let den = match parts.next() {
            Some(den) => den.trim().parse::<f64>().ok()?,
            None => 1.0,
        };
        if den == 0.0 || num == 0.0 {
            None
        } else {
            Some(num / den)
        }
    }

    /// `<dir>/<stem>.processed.<format>` next to `input`.
    pub(crate) fn processed_path(&self, input: &Path) -> PathBuf {
        let mut name = input.file_stem().map(OsString::from).unwrap_or_default();
        name.push(".processed.");
        name.push(&self.format);
        input.with_file_name(name)
    }
}

/// Query stream and container metadata with `ffprobe`.
pub(crate) fn probe<P>(path: P) -> Result<VideoInfo, Error>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let output = Command::new("ffprobe")
        .args(&[
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|e| Error::SpawnProbe(e, path.to_path_buf()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ProbeFailed(
            path.to_path_buf(),
            output.status,
            stderr.trim().to_owned(),
        ));
    }

    let info = VideoInfo::from_probe_json(&output.stdout, path)?;
    info!(
        message = "probed video",
        path = %path.display(),
        width = info.width,
        height = info.height,
        frame_rate = %info.frame_rate,
        pix_fmt = %info.pix_fmt,
        codec = %info.codec
    );
    Ok(info)
}

/// Splits a byte stream into fixed-size frames.
struct RawFrames<R> {
    reader: R,
    width: u32,
    height: u32,
    frame_len: usize,
    next_index: usize,
}

impl<R> RawFrames<R>
where
    R: Read,
{
    fn new(reader: R, width: u32, height: u32) -> Result<Self, Error> {
        Ok(Self {
            reader,
            width,
            height,
            frame_len: frame_len(width, height)?,
            next_index: 0,
        })
    }

    /// `None` on a clean end of stream; a partial frame is an error.
    fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        let mut data = vec![0; self.frame_len];
        let mut filled = 0;
        while filled < data.len() {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ReadFrame(e, self.next_index)),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < data.len() {
            return Err(Error::TruncatedFrame(self.next_index, filled, data.len()));
        }

        let frame = Frame {
            index: self.next_index,
            width: self.width,
            height: self.height,
            data,
        };
        self.next_index += 1;
        Ok(Some(frame))
    }
}

/// Decodes a video file to raw frames through an `ffmpeg` child process.
pub(crate) struct FrameReader {
    child: Child,
    frames: RawFrames<ChildStdout>,
    finished: bool,
}

impl FrameReader {
    pub(crate) fn open<P>(path: P, info: &VideoInfo) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut child = Command::new("ffmpeg")
            .args(&["-v", "error", "-i"])
            .arg(path)
            .args(&["-f", "rawvideo", "-pix_fmt", RAW_PIX_FMT, "pipe:"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnDecoder(e, path.to_path_buf()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::DecoderStdout(path.to_path_buf()))?;

        Ok(Self {
            child,
            frames: RawFrames::new(stdout, info.width, info.height)?,
            finished: false,
        })
    }
}

impl Drop for FrameReader {
    /// Stop and reap a decoder that still has frames to give.
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!(message = "decoder already stopped", error = %e);
        }
        if let Err(e) = self.child.wait() {
            warn!(message = "failed to wait for decoder", error = %e);
        }
    }
}

impl FrameSource for FrameReader {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        if self.finished {
            return Ok(None);
        }
        match self.frames.read_frame()? {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.finished = true;
                let status = self.child.wait().map_err(Error::WaitDecoder)?;
                if status.success() {
                    debug!(message = "decoder finished", frames = self.frames.next_index);
                    Ok(None)
                } else {
                    Err(Error::DecoderExited(status))
                }
            }
        }
    }
}

fn encoder_args(info: &VideoInfo, output: &Path) -> Vec<OsString> {
    let size = format!("{}x{}", info.width, info.height);
    let mut args = vec![
        "-v",
        "error",
        "-f",
        "rawvideo",
        "-pix_fmt",
        RAW_PIX_FMT,
        "-s",
        size.as_str(),
        "-r",
        info.frame_rate.as_str(),
        "-i",
        "pipe:",
        "-pix_fmt",
        info.pix_fmt.as_str(),
        "-vcodec",
        info.codec.as_str(),
        "-y",
    ]
    .iter()
    .map(OsString::from)
    .collect::<Vec<_>>();
    args.push(output.as_os_str().to_owned());
    args
}

/// Re-encodes raw frames with the source's rate, size, pixel format, and
/// codec by piping them into an `ffmpeg` child process.
pub(crate) struct Writer {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    frame_len: usize,
    output: PathBuf,
}

impl Writer {
    /// Any existing file at `output` is removed first.
    pub(crate) fn new<P>(output: P, info: &VideoInfo) -> Result<Self, Error>
    where
        P: Into<PathBuf>,
    {
        Self::with_command(Command::new("ffmpeg"), output, info)
    }

    /// Spawn `command` with the encoder arguments appended.
    fn with_command<P>(mut command: Command, output: P, info: &VideoInfo) -> Result<Self, Error>
    where
        P: Into<PathBuf>,
    {
        let output = output.into();
        if output.exists() {
            fs::remove_file(&output).map_err(|e| Error::RemoveOutput(e, output.clone()))?;
            debug!(message = "removed existing output", path = %output.display());
        }

        let mut child = command
            .args(encoder_args(info, &output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| Error::SpawnEncoder(e, output.clone()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::EncoderStdin(output.clone()))?;

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            frame_len: frame_len(info.width, info.height)?,
            output,
        })
    }

    pub(crate) fn output(&self) -> &Path {
        &self.output
    }

    /// Turn a failed pipe write into the encoder's exit status when it has
    /// already gone away.
    fn pipe_error(&mut self, e: io::Error) -> Error {
        match self.child.try_wait() {
            Ok(Some(status)) => Error::EncoderExited(status),
            _ => Error::EncoderPipe(e),
        }
    }

    /// Flush and close the pipe, then wait for the encoder to finalize the
    /// container.
    pub(crate) fn close(mut self) -> Result<(), Error> {
        let flushed = match self.stdin.take() {
            Some(mut stdin) => stdin.flush(),
            None => Ok(()),
        };
        // the pipe is closed here, so the encoder can finish before we wait
        let status = self.child.wait().map_err(Error::WaitEncoder)?;
        if let Err(e) = flushed {
            return Err(if status.success() {
                Error::EncoderPipe(e)
            } else {
                Error::EncoderExited(status)
            });
        }
        if !status.success() {
            return Err(Error::EncoderExited(status));
        }
        info!(message = "finished encoding", path = %self.output.display());
        Ok(())
    }
}

impl Drop for Writer {
    /// Reap the encoder when the writer is abandoned without `close`.
    fn drop(&mut self) {
        if let Some(stdin) = self.stdin.take() {
            drop(stdin);
            match self.child.wait() {
                Ok(status) => debug!(message = "encoder reaped", %status),
                Err(e) => warn!(message = "failed to wait for encoder", error = %e),
            }
        }
    }
}

impl FrameSink for Writer {
    fn write(&mut self, frame: &Frame) -> Result<(), Error> {
        if frame.data.len() != self.frame_len {
            return Err(Error::FrameSize(frame.index, frame.data.len(), self.frame_len));
        }
        let result = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(&frame.data),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        };
        result.map_err(|e| self.pipe_error(e))
    }
}
