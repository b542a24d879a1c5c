//! Encoded media files played into local tracks
//!
//! Video comes from IVF (VP8) files and audio from Ogg (Opus) files, written
//! sample by sample at the pace the container declares.

use bytes::Bytes;
use livecast_core::{Error, Result};
use std::{path::Path, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::io::{
    ivf_reader::{IVFFileHeader, IVFReader},
    ogg_reader::OggReader,
};

use crate::media::{LocalStream, LocalTrack, TrackKind};

/// Frame duration used when an IVF header carries no usable timebase
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Ogg pages are paced at the usual Opus frame size
const OGG_PAGE_DURATION: Duration = Duration::from_millis(20);

/// Opus granule positions count 48 kHz samples regardless of input rate
const OPUS_GRANULE_RATE: u64 = 48_000;

fn media_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::MediaAccess(format!("{what}: {e}"))
}

fn frame_duration(header: &IVFFileHeader) -> Duration {
    if header.timebase_denominator == 0 {
        return DEFAULT_FRAME_DURATION;
    }
    let nanos = 1_000_000_000 * u64::from(header.timebase_numerator)
        / u64::from(header.timebase_denominator);
    if nanos == 0 {
        DEFAULT_FRAME_DURATION
    } else {
        Duration::from_nanos(nanos)
    }
}

/// Media files to stream, loaded and header-checked up front
#[derive(Debug, Clone, Default)]
pub struct MediaFiles {
    video: Option<Bytes>,
    audio: Option<Bytes>,
}

impl MediaFiles {
    /// Read the given files; fails with `MediaAccess` when a file cannot be
    /// read or is not an IVF/Ogg file
    pub async fn load(video: Option<&Path>, audio: Option<&Path>) -> Result<Self> {
        let mut files = Self::default();

        if let Some(path) = video {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| media_error(&format!("Cannot read {}", path.display()), e))?;
            IVFReader::new(data.as_slice())
                .map_err(|e| media_error(&format!("{} is not an IVF file", path.display()), e))?;
            files.video = Some(Bytes::from(data));
        }

        if let Some(path) = audio {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| media_error(&format!("Cannot read {}", path.display()), e))?;
            OggReader::new(data.as_slice(), true)
                .map_err(|e| media_error(&format!("{} is not an Ogg Opus file", path.display()), e))?;
            files.audio = Some(Bytes::from(data));
        }

        Ok(files)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// Start one playback task per file that has a matching track in `stream`
    ///
    /// Each task resolves to the number of samples written. Playback ends at
    /// the end of the file (or never, with `repeat`), when `cancel` fires or
    /// when the track is stopped.
    pub fn spawn(
        &self,
        stream: &LocalStream,
        repeat: bool,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<Result<u64>>> {
        let mut tasks = Vec::new();

        if let Some(data) = &self.video {
            match stream.track(TrackKind::Video) {
                Some(track) => {
                    let (data, track, cancel) = (data.clone(), track.clone(), cancel.clone());
                    tasks.push(tokio::spawn(async move {
                        play_ivf(&data, &track, repeat, &cancel).await
                    }));
                }
                None => warn!(stream_id = %stream.id(), "Video file given but stream has no video track"),
            }
        }

        if let Some(data) = &self.audio {
            match stream.track(TrackKind::Audio) {
                Some(track) => {
                    let (data, track, cancel) = (data.clone(), track.clone(), cancel.clone());
                    tasks.push(tokio::spawn(async move {
                        play_ogg(&data, &track, repeat, &cancel).await
                    }));
                }
                None => warn!(stream_id = %stream.id(), "Audio file given but stream has no audio track"),
            }
        }

        tasks
    }
}

/// Wait for playback tasks started by [`MediaFiles::spawn`], returning the
/// total samples written. The first failure is returned after every task ends.
pub async fn join_playback(tasks: Vec<JoinHandle<Result<u64>>>) -> Result<u64> {
    let mut total = 0;
    let mut first_error = None;

    for task in tasks {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::Internal(format!("Playback task failed: {e}"))),
        };
        match outcome {
            Ok(written) => total += written,
            Err(e) => {
                warn!(error = %e, "Media playback failed");
                first_error.get_or_insert(e);
            }
        }
    }

    first_error.map_or(Ok(total), Err)
}

/// Wait for the next tick; `false` once playback should end
async fn pace(
    ticker: &mut tokio::time::Interval,
    track: &LocalTrack,
    cancel: &CancellationToken,
) -> bool {
    if track.is_stopped() {
        return false;
    }
    tokio::select! {
        () = cancel.cancelled() => false,
        _ = ticker.tick() => !track.is_stopped(),
    }
}

/// Write one sample; `false` when the track was stopped meanwhile
async fn write(track: &LocalTrack, data: Bytes, duration: Duration) -> Result<bool> {
    match track.write_sample(data, duration).await {
        Ok(()) => Ok(true),
        Err(Error::InvalidState(_)) if track.is_stopped() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Play an IVF file into `track`, one frame per timebase tick
pub async fn play_ivf(
    data: &[u8],
    track: &LocalTrack,
    repeat: bool,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut written = 0;

    loop {
        let (mut ivf, header) = IVFReader::new(data).map_err(|e| media_error("Invalid IVF data", e))?;
        let duration = frame_duration(&header);
        let mut ticker = interval(duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let before = written;

        // A read error marks the end of the frames
        while let Ok((frame, _)) = ivf.parse_next_frame() {
            if !pace(&mut ticker, track, cancel).await {
                return Ok(written);
            }
            if !write(track, frame.freeze(), duration).await? {
                return Ok(written);
            }
            written += 1;
        }

        debug!(track_id = %track.id(), frames = written - before, "IVF pass finished");
        if !repeat || written == before {
            break;
        }
    }

    info!(track_id = %track.id(), frames = written, "Video file played");
    Ok(written)
}

/// Play an Ogg Opus file into `track`, one page per sample
pub async fn play_ogg(
    data: &[u8],
    track: &LocalTrack,
    repeat: bool,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut written = 0;

    loop {
        let (mut ogg, _) =
            OggReader::new(data, true).map_err(|e| media_error("Invalid Ogg data", e))?;
        let mut ticker = interval(OGG_PAGE_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_granule = 0;
        let before = written;

        while let Ok((page, page_header)) = ogg.parse_next_page() {
            // Comment header page
            if page_header.granule_position == 0 {
                continue;
            }
            let samples = page_header.granule_position.saturating_sub(last_granule);
            last_granule = page_header.granule_position;

            if !pace(&mut ticker, track, cancel).await {
                return Ok(written);
            }
            let duration = Duration::from_micros(samples * 1_000_000 / OPUS_GRANULE_RATE);
            if !write(track, page.freeze(), duration).await? {
                return Ok(written);
            }
            written += 1;
        }

        debug!(track_id = %track.id(), pages = written - before, "Ogg pass finished");
        if !repeat || written == before {
            break;
        }
    }

    info!(track_id = %track.id(), pages = written, "Audio file played");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use webrtc::{
        media::io::{ogg_writer::OggWriter, Writer},
        rtp::{header::Header, packet::Packet},
    };

    /// IVF file with `frames` 4-byte frames at 30 fps
    fn ivf_bytes(frames: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"DKIF");
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&32u16.to_le_bytes());
        out.extend_from_slice(b"VP80");
        out.extend_from_slice(&640u16.to_le_bytes());
        out.extend_from_slice(&480u16.to_le_bytes());
        out.extend_from_slice(&30u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&frames.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for n in 0..frames {
            out.extend_from_slice(&4u32.to_le_bytes());
            out.extend_from_slice(&u64::from(n).to_le_bytes());
            out.extend_from_slice(&[0x10, 0x02, 0x00, 0x9d]);
        }
        out
    }

    fn temp_file(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file
    }

    #[test]
    fn test_frame_duration_from_timebase() {
        let (_, header) = IVFReader::new(ivf_bytes(0).as_slice()).unwrap();
        assert_eq!(frame_duration(&header), Duration::from_nanos(33_333_333));

        let broken = IVFFileHeader {
            timebase_denominator: 0,
            ..header
        };
        assert_eq!(frame_duration(&broken), DEFAULT_FRAME_DURATION);
    }

    #[tokio::test]
    async fn test_load_rejects_non_media_files() {
        let junk = temp_file(b"definitely not a container");

        let err = MediaFiles::load(Some(junk.path()), None).await.unwrap_err();
        assert!(matches!(err, Error::MediaAccess(_)));
        let err = MediaFiles::load(None, Some(junk.path())).await.unwrap_err();
        assert!(matches!(err, Error::MediaAccess(_)));
        let err = MediaFiles::load(Some(Path::new("/nonexistent/video.ivf")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaAccess(_)));

        assert!(MediaFiles::load(None, None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_ivf_writes_every_frame() {
        let track = LocalTrack::new(TrackKind::Video, "v", "s");
        let data = ivf_bytes(5);

        let written = play_ivf(&data, &track, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_stops_with_track_or_cancel() {
        let track = LocalTrack::new(TrackKind::Video, "v", "s");
        let data = ivf_bytes(3);

        // Repeating playback only ends through cancellation
        let cancel = CancellationToken::new();
        let task = {
            let (data, track, cancel) = (data.clone(), track.clone(), cancel.clone());
            tokio::spawn(async move { play_ivf(&data, &track, true, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert!(task.await.unwrap().unwrap() > 3);

        track.stop();
        let written = play_ivf(&data, &track, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_ogg_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut writer = OggWriter::new(file.reopen().unwrap(), 48_000, 2).unwrap();
            for n in 0..4u32 {
                let packet = Packet {
                    header: Header {
                        timestamp: 1 + n * 960,
                        ..Default::default()
                    },
                    payload: Bytes::from_static(&[0xfc, 0xff, 0xfe]),
                };
                writer.write_rtp(&packet).unwrap();
            }
            writer.close().unwrap();
        }

        let files = MediaFiles::load(None, Some(file.path())).await.unwrap();
        let track = LocalTrack::new(TrackKind::Audio, "a", "s");
        let data = files.audio.clone().unwrap();

        let written = play_ogg(&data, &track, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(written >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_matches_tracks() {
        let video = temp_file(&ivf_bytes(2));
        let files = MediaFiles::load(Some(video.path()), None).await.unwrap();
        let audio_only = LocalStream::new("s", vec![LocalTrack::new(TrackKind::Audio, "a", "s")]);
        let full = LocalStream::new(
            "s",
            vec![
                LocalTrack::new(TrackKind::Video, "v", "s"),
                LocalTrack::new(TrackKind::Audio, "a", "s"),
            ],
        );
        let cancel = CancellationToken::new();

        assert!(files.spawn(&audio_only, false, &cancel).is_empty());

        let tasks = files.spawn(&full, false, &cancel);
        assert_eq!(tasks.len(), 1);
        assert_eq!(join_playback(tasks).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_join_playback_reports_failures() {
        let ok = tokio::spawn(async { Ok(3) });
        let failed = tokio::spawn(async { Err(Error::MediaAccess("gone".to_string())) });
        let err = join_playback(vec![ok, failed]).await.unwrap_err();
        assert!(matches!(err, Error::MediaAccess(_)));

        let aborted = tokio::spawn(std::future::pending::<Result<u64>>());
        aborted.abort();
        let err = join_playback(vec![aborted]).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        assert_eq!(join_playback(Vec::new()).await.unwrap(), 0);
    }
}
