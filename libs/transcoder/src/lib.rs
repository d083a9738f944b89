//! Spawns and supervises the external H.264 transcoder child process.
//!
//! stdout is handed to the caller as a plain `ChildStdout` byte source;
//! stderr classification and process exit are surfaced as `DriverEvent`s on
//! an independent task each, so a noisy stderr can never stall stdout reads.

use std::process::{Command as StdCommand, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum StartError {
    BinaryMissing,
    SpawnFailed(String),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::BinaryMissing => write!(f, "transcoder binary not found"),
            StartError::SpawnFailed(msg) => write!(f, "failed to spawn transcoder: {msg}"),
        }
    }
}

impl std::error::Error for StartError {}

#[derive(Debug, Clone)]
pub enum DriverEvent {
    ExitedWithError(String),
    ExitedClean,
    FatalStderr(String),
    FpsDetected(f64),
}

const FATAL_PATTERNS: &[&str] = &[
    "404",
    "connection refused",
    "failed",
    "error opening input",
    "cannot load libcuda",
    "no capable venc found",
    "failed to initialise encoder",
    "failed to initialize encoder",
];

const SUPPRESSED_PATTERNS: &[&str] = &[
    "missing reference picture",
    "error constructing the reference",
    "rps",
    "undecodable nal unit",
    "pps id out of range",
    "no accelerated colorspace conversion found",
];

const HW_ENCODER_CANDIDATES: &[&str] = &["h264_vaapi", "h264_nvenc", "h264_videotoolbox", "h264_qsv"];

pub struct TranscoderConfig {
    pub rtsp_url: String,
    pub binary: String,
    pub initial_fps: u32,
}

pub struct Transcoder {
    pub stdout: ChildStdout,
    events_rx: mpsc::UnboundedReceiver<DriverEvent>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl Transcoder {
    pub async fn start(cfg: &TranscoderConfig) -> Result<Self, StartError> {
        let encoder = select_encoder(&cfg.binary);
        let args = build_args(&cfg.rtsp_url, &encoder, cfg.initial_fps);
        info!(encoder = %encoder, "starting transcoder");

        let mut child = Command::new(&cfg.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StartError::BinaryMissing
                } else {
                    StartError::SpawnFailed(e.to_string())
                }
            })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(stderr_reader_loop(stderr, tx.clone()));
        tokio::spawn(waiter_loop(child, kill_rx, tx));

        Ok(Self {
            stdout,
            events_rx: rx,
            kill_tx: Some(kill_tx),
        })
    }

    /// Awaits the next driver event. Resolves to `None` once the process
    /// has exited and its event sender has been dropped.
    pub async fn poll(&mut self) -> Option<DriverEvent> {
        self.events_rx.recv().await
    }

    /// Sends a termination request to the child. Reaping happens on the
    /// waiter task; callers observe completion via `poll()` returning
    /// `ExitedClean`/`ExitedWithError`.
    pub fn close(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn waiter_loop(
    mut child: tokio::process::Child,
    mut kill_rx: oneshot::Receiver<()>,
    tx: mpsc::UnboundedSender<DriverEvent>,
) {
    let status = tokio::select! {
        _ = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
        status = child.wait() => status,
    };

    let event = match status {
        Ok(s) if s.success() => DriverEvent::ExitedClean,
        Ok(s) => DriverEvent::ExitedWithError(format!("exit status {s}")),
        Err(e) => DriverEvent::ExitedWithError(e.to_string()),
    };
    let _ = tx.send(event);
}

async fn stderr_reader_loop(stderr: ChildStderr, tx: mpsc::UnboundedSender<DriverEvent>) {
    let mut lines = BufReader::new(stderr).lines();
    let mut last_fps: Option<f64> = None;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => classify_stderr_line(&line, &tx, &mut last_fps),
            Ok(None) => break,
            Err(e) => {
                warn!("transcoder stderr read error: {e}");
                break;
            }
        }
    }
}

fn classify_stderr_line(line: &str, tx: &mpsc::UnboundedSender<DriverEvent>, last_fps: &mut Option<f64>) {
    let lower = line.to_ascii_lowercase();

    if SUPPRESSED_PATTERNS.iter().any(|p| lower.contains(p)) {
        return;
    }

    if FATAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        error!("transcoder fatal: {line}");
        let _ = tx.send(DriverEvent::FatalStderr(line.to_string()));
        return;
    }

    if let Some(fps) = detect_fps(&lower) {
        if last_fps.map(|prev| (prev - fps).abs() > f64::EPSILON).unwrap_or(true) {
            *last_fps = Some(fps);
            debug!(fps, "observed frame rate changed");
            let _ = tx.send(DriverEvent::FpsDetected(fps));
        }
        return;
    }

    info!("transcoder: {line}");
}

/// Looks for an integer or decimal adjacent to the tokens `fps`/`tbr`.
fn detect_fps(lower: &str) -> Option<f64> {
    for token in ["fps=", "fps:", " fps", "tbr"] {
        if let Some(idx) = lower.find(token) {
            let tail = &lower[idx + token.len()..];
            let head = &lower[..idx];
            if let Some(v) = parse_adjacent_number(tail).or_else(|| parse_adjacent_number_reverse(head)) {
                if v > 0.0 && v < 1000.0 {
                    return Some(v);
                }
            }
        }
    }
    None
}

fn parse_adjacent_number(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].parse().ok()
}

fn parse_adjacent_number_reverse(s: &str) -> Option<f64> {
    let s = s.trim_end();
    let start = s
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
        .last()
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[start..].parse().ok()
}

fn select_encoder(binary: &str) -> String {
    for candidate in HW_ENCODER_CANDIDATES {
        let probe = StdCommand::new(binary)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "lavfi",
                "-i",
                "color=size=64x64:rate=1",
                "-frames:v",
                "1",
                "-c:v",
                candidate,
                "-f",
                "null",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if matches!(probe, Ok(status) if status.success()) {
            return candidate.to_string();
        }
    }
    "libx264".to_string()
}

fn build_args(rtsp_url: &str, encoder: &str, fps: u32) -> Vec<String> {
    let gop = fps.max(1).to_string();
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-rtsp_transport".into(),
        "tcp".into(),
        "-fflags".into(),
        "nobuffer".into(),
        "-flags".into(),
        "low_delay".into(),
        "-analyzeduration".into(),
        "1000000".into(),
        "-probesize".into(),
        "32768".into(),
        "-err_detect".into(),
        "ignore_err".into(),
        "-i".into(),
        rtsp_url.into(),
        "-an".into(),
        "-c:v".into(),
        encoder.into(),
        "-profile:v".into(),
        "baseline".into(),
        "-level:v".into(),
        "3.1".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-colorspace".into(),
        "bt709".into(),
        "-color_range".into(),
        "pc".into(),
        "-bf".into(),
        "0".into(),
        "-g".into(),
        gop,
        "-bsf:v".into(),
        "h264_mp4toannexb".into(),
        "-f".into(),
        "h264".into(),
        "-flush_packets".into(),
        "1".into(),
        "pipe:1".into(),
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fatal_pattern_detected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut last_fps = None;
        classify_stderr_line("Error opening input: 404 not found", &tx, &mut last_fps);
        drop(tx);
        assert!(matches!(rx.try_recv(), Ok(DriverEvent::FatalStderr(_))));
    }

    #[test]
    fn suppressed_pattern_produces_no_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut last_fps = None;
        classify_stderr_line("non-existing PPS id referenced, PPS id out of range", &tx, &mut last_fps);
        drop(tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fps_detected_once_per_change() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut last_fps = None;
        classify_stderr_line("frame=  120 fps= 30 q=-1.0", &tx, &mut last_fps);
        classify_stderr_line("frame=  150 fps= 30 q=-1.0", &tx, &mut last_fps);
        classify_stderr_line("frame=  180 fps= 25 q=-1.0", &tx, &mut last_fps);
        drop(tx);

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn build_args_carries_fixed_profile() {
        let args = build_args("rtsp://example/stream", "libx264", 30);
        assert!(args.iter().any(|a| a == "baseline"));
        assert!(args.iter().any(|a| a == "yuv420p"));
        assert!(args.iter().any(|a| a == "h264_mp4toannexb"));
    }
}
