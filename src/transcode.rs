// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/transcode.rs - 外部编码器转码与进度解析
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 把中间容器转码为交付用的 H.264 MP4。
//!
//! 转码进度是一个惰性的异步流：按 `\r` 或 `\n` 切分编码器 stderr，解析其中的
//! `time=HH:MM:SS` 标记，除以预先探测到的总时长得到百分比。流单调不减，
//! 进程正常退出时以 100 结尾，非零退出码以 [`TranscodeError::Failed`] 结尾。
//! 流被提前丢弃时编码器进程随之终止。

use std::{
  path::{Path, PathBuf},
  process::Stdio,
};

use futures_util::{
  StreamExt,
  stream::{self, BoxStream},
};
use serde::Deserialize;
use thiserror::Error;
use tokio::{
  io::AsyncRead,
  process::{Child, ChildStderr, Command},
};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TranscodeError {
  #[error("找不到编码器可执行文件: {0}")]
  NotFound(String),
  #[error("转码输入不存在: {0}")]
  InputMissing(String),
  #[error("无法启动编码器: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("编码器异常退出，退出码: {code:?}")]
  Failed { code: Option<i32> },
}

/// 转码进度流，元素为 0~100 的百分比
pub type ProgressStream = BoxStream<'static, Result<f64, TranscodeError>>;

pub trait Transcode: Send + Sync {
  /// 输入不存在时立即失败，其余错误在流中给出
  fn transcode(&self, input: &Path, output: &Path) -> Result<ProgressStream, TranscodeError>;
}

/// 基于 ffmpeg 的转码器
#[derive(Debug, Clone)]
pub struct Transcoder {
  ffmpeg: PathBuf,
  ffprobe: PathBuf,
}

impl Transcoder {
  pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
    Self {
      ffmpeg: ffmpeg.into(),
      ffprobe: ffprobe.into(),
    }
  }

  /// 确认编码器可执行文件存在
  pub fn check(&self) -> Result<(), TranscodeError> {
    for program in [&self.ffmpeg, &self.ffprobe] {
      which::which(program).map_err(|_| TranscodeError::NotFound(program.display().to_string()))?;
    }
    Ok(())
  }

  /// 探测视频总时长（秒），无法确定时为 0
  pub async fn probe_duration(&self, path: &Path) -> f64 {
    let output = Command::new(&self.ffprobe)
      .args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
      ])
      .arg(path)
      .stdin(Stdio::null())
      .stderr(Stdio::null())
      .output()
      .await;

    let output = match output {
      Ok(output) if output.status.success() => output,
      Ok(output) => {
        warn!("ffprobe 退出码异常: {:?}", output.status.code());
        return 0.0;
      }
      Err(e) => {
        warn!("无法运行 ffprobe: {}", e);
        return 0.0;
      }
    };

    match serde_json::from_slice::<FfprobeOutput>(&output.stdout) {
      Ok(probe) => probe.duration_secs(),
      Err(e) => {
        warn!("无法解析 ffprobe 输出: {}", e);
        0.0
      }
    }
  }

  fn command(&self, input: &Path, output: &Path) -> Command {
    let mut command = Command::new(&self.ffmpeg);
    command
      .args(["-hide_banner", "-nostdin", "-y", "-i"])
      .arg(input)
      .args(["-vcodec", "libx264", "-progress", "pipe:2", "-nostats"])
      .arg(output);
    command
  }
}

impl Transcode for Transcoder {
  fn transcode(&self, input: &Path, output: &Path) -> Result<ProgressStream, TranscodeError> {
    if !input.is_file() {
      return Err(TranscodeError::InputMissing(input.display().to_string()));
    }
    let transcoder = self.clone();
    let (input, output) = (input.to_path_buf(), output.to_path_buf());

    let started = stream::once(async move {
      let total_secs = transcoder.probe_duration(&input).await;
      info!(
        "开始转码: {} -> {} (总时长 {:.2} 秒)",
        input.display(),
        output.display(),
        total_secs
      );
      TranscodeProgress::spawn(transcoder.command(&input, &output), total_secs)
    });
    Ok(
      started
        .flat_map(|spawned| match spawned {
          Ok(progress) => progress.into_stream(),
          Err(e) => stream::iter([Err(e)]).boxed(),
        })
        .boxed(),
    )
  }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
  #[serde(default)]
  streams: Vec<FfprobeStream>,
  format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
  codec_type: Option<String>,
  nb_frames: Option<String>,
  r_frame_rate: Option<String>,
  avg_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
  duration: Option<String>,
}

impl FfprobeOutput {
  // 优先用帧数 / 帧率，其次用容器时长
  fn duration_secs(&self) -> f64 {
    let from_frames = self
      .streams
      .iter()
      .find(|s| s.codec_type.as_deref() == Some("video"))
      .and_then(|s| {
        let frames: f64 = s.nb_frames.as_deref()?.parse().ok()?;
        let fps = s
          .r_frame_rate
          .as_deref()
          .and_then(parse_rate)
          .or_else(|| s.avg_frame_rate.as_deref().and_then(parse_rate))?;
        Some(frames / fps)
      });
    let from_format = || {
      self
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
    };
    from_frames
      .or_else(from_format)
      .filter(|d| d.is_finite() && *d > 0.0)
      .unwrap_or(0.0)
  }
}

fn parse_rate(rate: &str) -> Option<f64> {
  let value = match rate.split_once('/') {
    Some((num, den)) => num.parse::<f64>().ok()? / den.parse::<f64>().ok()?,
    None => rate.parse().ok()?,
  };
  (value.is_finite() && value > 0.0).then_some(value)
}

/// 解析一行中的 `time=HH:MM:SS(.frac)` 标记
///
/// 没有标记时返回 `Ok(None)`，标记无法解析时返回 `Err`。
pub fn parse_time_marker(line: &str) -> Result<Option<f64>, String> {
  let Some(pos) = line.find("time=") else {
    return Ok(None);
  };
  let token = line[pos + "time=".len()..]
    .split_whitespace()
    .next()
    .unwrap_or("");

  let parts: Vec<&str> = token.split(':').collect();
  if parts.len() != 3 {
    return Err(format!("无法解析的时间标记: {:?}", token));
  }
  let mut seconds = 0f64;
  for part in parts {
    let value: f64 = part
      .parse()
      .map_err(|_| format!("无法解析的时间标记: {:?}", token))?;
    seconds = seconds * 60.0 + value;
  }
  Ok(Some(seconds))
}

/// 把时间标记换算为单调不减的百分比
#[derive(Debug, Clone)]
pub struct ProgressTracker {
  total_secs: f64,
  last: f64,
}

impl ProgressTracker {
  pub fn new(total_secs: f64) -> Self {
    Self {
      total_secs,
      last: 0.0,
    }
  }

  /// 有新进度时返回百分比
  pub fn observe(&mut self, line: &str) -> Option<f64> {
    if self.total_secs <= 0.0 {
      return None;
    }
    let seconds = match parse_time_marker(line) {
      Ok(Some(seconds)) => seconds,
      Ok(None) => return None,
      Err(reason) => {
        debug!("{}", reason);
        return None;
      }
    };
    let percent = (seconds / self.total_secs * 100.0).clamp(0.0, 100.0);
    if percent > self.last {
      self.last = percent;
      Some(percent)
    } else {
      None
    }
  }
}

/// 按 `\r` 或 `\n` 切分编码器输出
fn progress_lines<R: AsyncRead>(reader: R) -> FramedRead<R, AnyDelimiterCodec> {
  FramedRead::new(reader, AnyDelimiterCodec::new(b"\r\n".to_vec(), b"\n".to_vec()))
}

/// 运行中的编码器进程及其进度
pub struct TranscodeProgress {
  lines: FramedRead<ChildStderr, AnyDelimiterCodec>,
  tracker: ProgressTracker,
  child: Child,
}

impl TranscodeProgress {
  fn spawn(mut command: Command, total_secs: f64) -> Result<Self, TranscodeError> {
    let mut child = command
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;
    let stderr = child
      .stderr
      .take()
      .ok_or_else(|| std::io::Error::other("编码器 stderr 未捕获"))?;

    Ok(Self {
      lines: progress_lines(stderr),
      tracker: ProgressTracker::new(total_secs),
      child,
    })
  }

  pub fn into_stream(self) -> ProgressStream {
    stream::unfold(Some(self), |state| async move {
      let mut progress = state?;
      while let Some(line) = progress.lines.next().await {
        match line {
          Ok(line) => {
            if let Some(percent) = progress.tracker.observe(&String::from_utf8_lossy(&line)) {
              return Some((Ok(percent), Some(progress)));
            }
          }
          Err(e) => {
            warn!("读取编码器输出失败: {}", e);
            break;
          }
        }
      }

      // 输出结束后检查退出码
      let result = match progress.child.wait().await {
        Ok(status) if status.success() => {
          info!("转码完成");
          Ok(100.0)
        }
        Ok(status) => Err(TranscodeError::Failed {
          code: status.code(),
        }),
        Err(e) => Err(TranscodeError::Spawn(e)),
      };
      Some((result, None))
    })
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_time_marker() {
    let line = "frame=  120 fps= 30 q=28.0 size=512kB time=00:01:02.50 bitrate=1000kbits/s";
    assert_eq!(parse_time_marker(line).unwrap(), Some(62.5));
    assert_eq!(parse_time_marker("out_time=00:00:03.000000").unwrap(), Some(3.0));
    assert_eq!(parse_time_marker("progress=continue").unwrap(), None);
    assert!(parse_time_marker("out_time=N/A").is_err());
    assert!(parse_time_marker("time=12.5").is_err());
  }

  #[test]
  fn test_tracker_is_monotonic_and_clamped() {
    let mut tracker = ProgressTracker::new(10.0);
    assert_eq!(tracker.observe("time=00:00:02.00"), Some(20.0));
    assert_eq!(tracker.observe("time=00:00:01.00"), None);
    assert_eq!(tracker.observe("time=N/A"), None);
    assert_eq!(tracker.observe("time=00:00:15.00"), Some(100.0));
    assert_eq!(tracker.observe("time=00:00:20.00"), None);
  }

  #[test]
  fn test_tracker_without_duration() {
    let mut tracker = ProgressTracker::new(0.0);
    assert_eq!(tracker.observe("time=00:00:02.00"), None);
  }

  #[tokio::test]
  async fn test_lines_split_on_carriage_return() {
    let data: &[u8] = b"a=1\rb=2\r\nc=3\nlast";
    let lines: Vec<String> = progress_lines(data)
      .map(|line| String::from_utf8_lossy(&line.unwrap()).into_owned())
      .collect()
      .await;
    assert_eq!(lines, vec!["a=1", "b=2", "", "c=3", "last"]);
  }

  #[test]
  fn test_ffprobe_duration() {
    let json = r#"{"streams":[{"codec_type":"video","nb_frames":"250","r_frame_rate":"25/1"}],
      "format":{"duration":"11.0"}}"#;
    let probe: FfprobeOutput = serde_json::from_str(json).unwrap();
    assert!((probe.duration_secs() - 10.0).abs() < 1e-9);

    let json = r#"{"streams":[{"codec_type":"video"}],"format":{"duration":"7.5"}}"#;
    let probe: FfprobeOutput = serde_json::from_str(json).unwrap();
    assert!((probe.duration_secs() - 7.5).abs() < 1e-9);

    let probe: FfprobeOutput = serde_json::from_str(r#"{"streams":[]}"#).unwrap();
    assert_eq!(probe.duration_secs(), 0.0);
  }

  #[cfg(unix)]
  fn shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
  }

  #[cfg(unix)]
  async fn events(script: &str, total_secs: f64) -> Vec<Result<f64, TranscodeError>> {
    TranscodeProgress::spawn(shell(script), total_secs)
      .unwrap()
      .into_stream()
      .collect()
      .await
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_progress_ends_at_100() {
    let script = r"printf 'frame=1 time=00:00:01.00 x\rframe=2 time=00:00:03.00 x\rtime=N/A\nframe=3 time=00:00:02.00 x\n' >&2";
    let events: Vec<f64> = events(script, 4.0).await.into_iter().map(|e| e.unwrap()).collect();
    assert_eq!(events, vec![25.0, 75.0, 100.0]);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_unknown_duration_yields_only_terminal() {
    let events: Vec<f64> = events(r"printf 'time=00:00:01.00\n' >&2", 0.0)
      .await
      .into_iter()
      .map(|e| e.unwrap())
      .collect();
    assert_eq!(events, vec![100.0]);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_nonzero_exit_is_error() {
    let events = events(r"printf 'time=00:00:01.00\n' >&2; exit 3", 2.0).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].as_ref().unwrap(), &50.0);
    assert!(matches!(
      events[1],
      Err(TranscodeError::Failed { code: Some(3) })
    ));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_missing_encoder_fails_in_stream() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("container.avi");
    std::fs::write(&input, b"avi").unwrap();
    let transcoder = Transcoder::new(dir.path().join("no-ffmpeg"), dir.path().join("no-ffprobe"));
    let events: Vec<_> = transcoder
      .transcode(&input, &dir.path().join("out.mp4"))
      .unwrap()
      .collect()
      .await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Err(TranscodeError::Spawn(_))));
  }

  #[test]
  fn test_missing_input() {
    let transcoder = Transcoder::new("ffmpeg", "ffprobe");
    assert!(matches!(
      transcoder.transcode(Path::new("/nonexistent/container.avi"), Path::new("/tmp/out.mp4")),
      Err(TranscodeError::InputMissing(_))
    ));
  }
}
