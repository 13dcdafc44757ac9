use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{EncoderKind, EncoderSection};

use super::error::{ProcessorError, ProcessorResult};
use super::types::{EncodedMedia, MediaContainer, MediaStream, OutputDescriptor};

const TS_PACKET_LEN: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

/// Turns a fetched stream into one playable file.
///
/// The stream is consumed on every path, so its spool file is gone by the
/// time `encode` returns.
#[async_trait]
pub trait Encoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn extension(&self) -> &'static str;

    async fn encode(
        &self,
        stream: MediaStream,
        output: &OutputDescriptor,
    ) -> ProcessorResult<EncodedMedia>;
}

pub fn build_encoder(section: &EncoderSection) -> Arc<dyn Encoder> {
    match section.kind {
        EncoderKind::Remux => Arc::new(RemuxEncoder::new(&section.ffmpeg_path, section.faststart)),
        EncoderKind::Concat => Arc::new(ConcatEncoder),
    }
}

/// Stream-copies the joined segments into an MP4 container with ffmpeg.
#[derive(Debug, Clone)]
pub struct RemuxEncoder {
    ffmpeg: PathBuf,
    faststart: bool,
}

impl RemuxEncoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, faststart: bool) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            faststart,
        }
    }

    fn arguments(&self, input: &Path, container: MediaContainer, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
        ];
        if container == MediaContainer::MpegTs {
            args.push("-bsf:a".to_string());
            args.push("aac_adtstoasc".to_string());
        }
        if self.faststart {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }
        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl Encoder for RemuxEncoder {
    fn name(&self) -> &'static str {
        "remux"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    async fn encode(
        &self,
        stream: MediaStream,
        output: &OutputDescriptor,
    ) -> ProcessorResult<EncodedMedia> {
        let failed = |cause: String| ProcessorError::EncodeFailed {
            video_id: output.video_id,
            cause,
        };
        prepare_output(&output.path).await?;
        let args = self.arguments(stream.path(), stream.container(), &output.path);
        debug!(ffmpeg = %self.ffmpeg.display(), ?args, "running remux");
        let result = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| failed(format!("failed to launch {}: {err}", self.ffmpeg.display())))?;
        drop(stream);
        if !result.status.success() {
            discard_partial(&output.path).await;
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no diagnostic output");
            return Err(failed(format!("ffmpeg exited with {}: {detail}", result.status)));
        }
        let media = EncodedMedia::from_file(output.video_id, &output.path)?;
        info!(
            video_id = ?output.video_id,
            path = %output.path.display(),
            size_bytes = media.size_bytes(),
            "remux complete"
        );
        Ok(media)
    }
}

/// Writes the joined MPEG-TS stream as-is after checking packet framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatEncoder;

#[async_trait]
impl Encoder for ConcatEncoder {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn extension(&self) -> &'static str {
        "ts"
    }

    async fn encode(
        &self,
        stream: MediaStream,
        output: &OutputDescriptor,
    ) -> ProcessorResult<EncodedMedia> {
        let failed = |cause: String| ProcessorError::EncodeFailed {
            video_id: output.video_id,
            cause,
        };
        if stream.container() == MediaContainer::Mp4 {
            return Err(failed("concat encoder only accepts MPEG-TS input".into()));
        }
        prepare_output(&output.path).await?;
        let copied = copy_ts_packets(stream.path(), &output.path).await;
        drop(stream);
        match copied {
            Ok(packets) => {
                let media = EncodedMedia::from_file(output.video_id, &output.path)?;
                info!(
                    video_id = ?output.video_id,
                    path = %output.path.display(),
                    packets,
                    "concat complete"
                );
                Ok(media)
            }
            Err(cause) => {
                discard_partial(&output.path).await;
                Err(failed(cause))
            }
        }
    }
}

async fn copy_ts_packets(input: &Path, output: &Path) -> Result<u64, String> {
    let mut reader = fs::File::open(input)
        .await
        .map_err(|err| format!("failed to open {}: {err}", input.display()))?;
    let mut writer = fs::File::create(output)
        .await
        .map_err(|err| format!("failed to create {}: {err}", output.display()))?;
    let mut buffer = vec![0u8; TS_PACKET_LEN * 512];
    let mut filled = 0usize;
    let mut packets = 0u64;
    loop {
        let read = reader
            .read(&mut buffer[filled..])
            .await
            .map_err(|err| format!("read failed: {err}"))?;
        filled += read;
        let whole = filled - filled % TS_PACKET_LEN;
        for packet in buffer[..whole].chunks(TS_PACKET_LEN) {
            if packet[0] != TS_SYNC_BYTE {
                return Err(format!("lost sync at packet {packets}"));
            }
            packets += 1;
        }
        writer
            .write_all(&buffer[..whole])
            .await
            .map_err(|err| format!("write failed: {err}"))?;
        buffer.copy_within(whole..filled, 0);
        filled -= whole;
        if read == 0 {
            break;
        }
    }
    if filled != 0 {
        return Err(format!("truncated packet of {filled} bytes at end of stream"));
    }
    if packets == 0 {
        return Err("stream is empty".into());
    }
    writer
        .flush()
        .await
        .map_err(|err| format!("flush failed: {err}"))?;
    Ok(packets)
}

async fn prepare_output(path: &Path) -> ProcessorResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| ProcessorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

async fn discard_partial(path: &Path) {
    if fs::remove_file(path).await.is_ok() {
        debug!(path = %path.display(), "removed partial output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_bytes(packets: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; packets * TS_PACKET_LEN];
        for packet in bytes.chunks_mut(TS_PACKET_LEN) {
            packet[0] = TS_SYNC_BYTE;
        }
        bytes
    }

    #[tokio::test]
    async fn concat_writes_valid_transport_stream() {
        let dir = tempfile::tempdir().unwrap();
        let stream = MediaStream::from_bytes(
            &dir.path().join("spool"),
            MediaContainer::MpegTs,
            &ts_bytes(1500),
        )
        .unwrap();
        let spool_path = stream.path().to_path_buf();
        let output = OutputDescriptor::ad_hoc(dir.path().join("out/a.ts"));
        let media = ConcatEncoder.encode(stream, &output).await.unwrap();
        assert_eq!(media.size_bytes(), (1500 * TS_PACKET_LEN) as u64);
        assert!(!spool_path.exists());
    }

    #[tokio::test]
    async fn concat_rejects_corrupt_segment_and_releases_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = ts_bytes(4);
        bytes[TS_PACKET_LEN * 2] = 0x00;
        let stream = MediaStream::from_bytes(
            &dir.path().join("spool"),
            MediaContainer::MpegTs,
            &bytes,
        )
        .unwrap();
        let spool_path = stream.path().to_path_buf();
        let output = OutputDescriptor {
            video_id: Some(3),
            path: dir.path().join("out/3.ts"),
        };
        let err = ConcatEncoder.encode(stream, &output).await.unwrap_err();
        match err {
            ProcessorError::EncodeFailed { video_id, cause } => {
                assert_eq!(video_id, Some(3));
                assert!(cause.contains("lost sync"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!spool_path.exists());
        assert!(!output.path.exists());
    }

    #[tokio::test]
    async fn remux_reports_missing_binary_as_encode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stream = MediaStream::from_bytes(
            &dir.path().join("spool"),
            MediaContainer::MpegTs,
            &ts_bytes(1),
        )
        .unwrap();
        let encoder = RemuxEncoder::new(dir.path().join("no-such-ffmpeg"), true);
        let output = OutputDescriptor::ad_hoc(dir.path().join("a.mp4"));
        let err = encoder.encode(stream, &output).await.unwrap_err();
        assert!(matches!(err, ProcessorError::EncodeFailed { video_id: None, .. }));
    }

    #[test]
    fn remux_arguments_follow_container() {
        let encoder = RemuxEncoder::new("ffmpeg", true);
        let args = encoder.arguments(
            Path::new("/tmp/in.part"),
            MediaContainer::MpegTs,
            Path::new("/tmp/out.mp4"),
        );
        assert!(args.windows(2).any(|pair| pair == ["-bsf:a", "aac_adtstoasc"]));
        assert!(args.windows(2).any(|pair| pair == ["-movflags", "+faststart"]));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));

        let plain = RemuxEncoder::new("ffmpeg", false).arguments(
            Path::new("/tmp/in.part"),
            MediaContainer::Mp4,
            Path::new("/tmp/out.mp4"),
        );
        assert!(!plain.iter().any(|arg| arg == "-bsf:a" || arg == "-movflags"));
    }
}
