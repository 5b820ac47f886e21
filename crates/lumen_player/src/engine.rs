//! 播放引擎
//!
//! 当前曲目、传输控制和播放位置的唯一来源。位置不查询解码器，而是按墙上时钟
//! 从播放/跳转时记下的锚点推算，暂停多久锚点就后移多久。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    AudioDecoder, AudioInfo, DecoderError, DecoderSource, MemorySource, Mixer, PlaybackState,
    PreloadFormat, PreloadedTrack, SourceError, TrackInfo, TrackTags, MAX_VOLUME, UNKNOWN_ALBUM,
    UNKNOWN_ARTIST,
};

/// 播放错误
#[derive(thiserror::Error, Debug)]
pub enum PlaybackError {
    #[error("Failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: DecoderError,
    },

    #[error("Preloaded buffer rejected: {0}")]
    Buffer(#[source] SourceError),

    #[error("Preloaded track has no buffer")]
    MissingBuffer,

    #[error("Seek failed: {0}")]
    Seek(#[source] SourceError),

    #[error("Stream is not seekable")]
    NotSeekable,

    #[error("No track loaded")]
    NotLoaded,

    #[error("Invalid seek offset: {0}")]
    InvalidSeek(f64),
}

/// 预加载曲目装载失败，曲目原样交还调用方
#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub struct RejectedPreload {
    pub track: PreloadedTrack,
    #[source]
    pub error: PlaybackError,
}

/// 播放引擎
pub struct PlaybackEngine {
    mixer: Arc<Mixer>,
    state: PlaybackState,
    info: TrackInfo,
    volume: i32,
    /// 位置 = anchor_pos + (now - anchor_at)
    anchor_at: Instant,
    anchor_pos: Duration,
    paused_at: Option<Instant>,
    /// 当前播放的是管道流
    streaming: bool,
}

impl PlaybackEngine {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        let volume = mixer.volume() as i32 * 100 / MAX_VOLUME as i32;
        Self {
            mixer,
            state: PlaybackState::Stopped,
            info: TrackInfo::default(),
            volume,
            anchor_at: Instant::now(),
            anchor_pos: Duration::ZERO,
            paused_at: None,
            streaming: false,
        }
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// 只读快照，下次 load 前有效
    pub fn track_info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// 加载文件（暂停在 0 位置）
    ///
    /// 先停止当前曲目。失败时引擎保持 Stopped，不留半加载状态。
    pub fn load(&mut self, path: &Path) -> Result<(), PlaybackError> {
        self.stop();

        let decoder = AudioDecoder::open(path).map_err(|source| {
            log::warn!("failed to open {:?}: {}", path, source);
            PlaybackError::Open {
                path: path.to_path_buf(),
                source,
            }
        })?;

        self.check_rate(decoder.info.sample_rate, path);
        let duration = probe_duration(path, &decoder.info);
        let tags = decoder.tags.clone();

        self.mixer.load_music(Box::new(DecoderSource::new(decoder)));
        self.install(path, &tags, duration);
        log::info!("loaded {:?} ({:.1}s)", path, duration.as_secs_f64());
        Ok(())
    }

    /// 装载预加载结果，跳过解码
    ///
    /// 成功后缓冲归引擎所有；失败时连同缓冲一起交还。
    pub fn load_preloaded(&mut self, mut track: PreloadedTrack) -> Result<(), RejectedPreload> {
        if track.format == PreloadFormat::Native {
            return match self.load(&track.path) {
                Ok(()) => Ok(()),
                Err(error) => Err(RejectedPreload { track, error }),
            };
        }

        self.stop();

        let Some(buffer) = track.buffer.take() else {
            return Err(RejectedPreload {
                track,
                error: PlaybackError::MissingBuffer,
            });
        };

        let source = match MemorySource::try_from_wav(buffer) {
            Ok(source) => source,
            Err((e, buffer)) => {
                log::warn!("preloaded buffer for {:?} rejected: {}", track.path, e);
                track.buffer = Some(buffer);
                return Err(RejectedPreload {
                    track,
                    error: PlaybackError::Buffer(e),
                });
            }
        };

        self.check_rate(source.header().sample_rate, &track.path);
        let duration = if track.duration.is_zero() {
            Duration::from_secs_f64(source.header().duration_secs())
        } else {
            track.duration
        };

        self.mixer.load_music(Box::new(source));
        self.install(&track.path, &track.tags, duration);
        log::info!("loaded preloaded {:?}", track.path);
        Ok(())
    }

    /// 切换到管道流播放，立即开始
    pub fn begin_stream(&mut self, title: &str) {
        self.stop();
        self.info = TrackInfo {
            path: PathBuf::new(),
            title: title.to_string(),
            artist: UNKNOWN_ARTIST.to_string(),
            album: UNKNOWN_ALBUM.to_string(),
            duration: Duration::ZERO,
            position: Duration::ZERO,
        };
        self.streaming = true;
        self.state = PlaybackState::Loaded;
        let _ = self.play_at(Instant::now());
    }

    fn install(&mut self, path: &Path, tags: &TrackTags, duration: Duration) {
        self.info = TrackInfo {
            path: path.to_path_buf(),
            title: tags.display_title(path),
            artist: tags.display_artist(),
            album: tags.display_album(),
            duration,
            position: Duration::ZERO,
        };
        self.anchor_pos = Duration::ZERO;
        self.paused_at = None;
        self.state = PlaybackState::Loaded;
    }

    fn check_rate(&self, rate: u32, path: &Path) {
        if rate != self.mixer.sample_rate() {
            log::warn!(
                "{:?} is {} Hz, mixer runs at {} Hz; playback speed will be off",
                path,
                rate,
                self.mixer.sample_rate()
            );
        }
    }

    pub fn play(&mut self) -> Result<(), PlaybackError> {
        self.play_at(Instant::now())
    }

    fn play_at(&mut self, now: Instant) -> Result<(), PlaybackError> {
        match self.state {
            PlaybackState::Stopped => return Err(PlaybackError::NotLoaded),
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Loaded => {
                self.anchor_at = now;
                self.anchor_pos = self.info.position;
            }
            PlaybackState::Paused => {
                if let Some(paused_at) = self.paused_at.take() {
                    self.anchor_at += now.saturating_duration_since(paused_at);
                }
            }
        }
        self.mixer.resume();
        self.state = PlaybackState::Playing;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    fn pause_at(&mut self, now: Instant) {
        if self.state != PlaybackState::Playing {
            return;
        }
        self.update_at(now);
        self.mixer.pause();
        self.paused_at = Some(now);
        self.state = PlaybackState::Paused;
    }

    pub fn toggle_pause(&mut self) -> Result<(), PlaybackError> {
        match self.state {
            PlaybackState::Playing => {
                self.pause();
                Ok(())
            }
            _ => self.play(),
        }
    }

    /// 停止并完全释放当前曲目
    pub fn stop(&mut self) {
        self.mixer.halt();
        if self.state != PlaybackState::Stopped {
            log::debug!("stopped {:?}", self.info.path);
        }
        self.info = TrackInfo::default();
        self.anchor_pos = Duration::ZERO;
        self.paused_at = None;
        self.streaming = false;
        self.state = PlaybackState::Stopped;
    }

    /// 相对跳转，结果小于 0 时跳到开头
    pub fn seek_relative(&mut self, delta_secs: f64) -> Result<(), PlaybackError> {
        self.ensure_seekable()?;
        if delta_secs.is_nan() {
            return Err(PlaybackError::InvalidSeek(delta_secs));
        }
        let target = (self.info.position.as_secs_f64() + delta_secs).max(0.0);
        // 超出 Duration 表示范围时按时长截断
        let target = match Duration::try_from_secs_f64(target) {
            Ok(target) => target,
            Err(_) if !self.info.duration.is_zero() => self.info.duration,
            Err(_) => return Err(PlaybackError::InvalidSeek(delta_secs)),
        };
        self.seek_absolute(target)
    }

    pub fn seek_absolute(&mut self, target: Duration) -> Result<(), PlaybackError> {
        self.seek_at(target, Instant::now())
    }

    fn ensure_seekable(&self) -> Result<(), PlaybackError> {
        if self.state == PlaybackState::Stopped {
            return Err(PlaybackError::NotLoaded);
        }
        if self.streaming {
            return Err(PlaybackError::NotSeekable);
        }
        Ok(())
    }

    fn seek_at(&mut self, target: Duration, now: Instant) -> Result<(), PlaybackError> {
        self.ensure_seekable()?;

        let target = if self.info.duration.is_zero() {
            target
        } else {
            target.min(self.info.duration)
        };

        // 失败时位置保持不变
        self.mixer
            .seek(target.as_secs_f64())
            .map_err(PlaybackError::Seek)?;

        self.info.position = target;
        self.anchor_pos = target;
        self.anchor_at = now;
        if self.paused_at.is_some() {
            self.paused_at = Some(now);
        }
        Ok(())
    }

    /// 设置音量 (0 - 100)，超出范围时截断
    pub fn set_volume(&mut self, volume: i32) {
        self.volume = volume.clamp(0, 100);
        let native = (self.volume * MAX_VOLUME as i32 + 50) / 100;
        self.mixer.set_volume(native as u8);
    }

    pub fn volume(&self) -> i32 {
        self.volume
    }

    /// 每个 UI tick 调用一次，刷新播放位置
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    fn update_at(&mut self, now: Instant) {
        self.mixer.reap();
        if self.state != PlaybackState::Playing {
            return;
        }

        let mut position = self.anchor_pos + now.saturating_duration_since(self.anchor_at);
        if !self.info.duration.is_zero() {
            position = position.min(self.info.duration);
        }
        self.info.position = position;
    }

    /// 文件曲目已经播完
    pub fn is_finished(&self) -> bool {
        self.state == PlaybackState::Playing && !self.streaming && self.mixer.is_drained()
    }

    /// 剩余时长，总时长未知时为 None
    pub fn remaining(&self) -> Option<Duration> {
        self.info.remaining()
    }
}

/// 先取解码器给出的时长；MP3 拿不到时按首帧码率估算
fn probe_duration(path: &Path, info: &AudioInfo) -> Duration {
    if let Some(duration) = info.duration.filter(|d| !d.is_zero()) {
        return duration;
    }

    let is_mpeg = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "mp3" | "mp2" | "mpga"));
    if !is_mpeg {
        return Duration::ZERO;
    }

    match lumen_format::estimate_file_duration(path) {
        Ok(duration) => duration,
        Err(e) => {
            log::debug!("bitrate estimate failed for {:?}: {}", path, e);
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_format::wav_from_samples;

    fn engine() -> PlaybackEngine {
        PlaybackEngine::new(Arc::new(Mixer::new(44100)))
    }

    fn tone(frames: usize) -> Vec<u8> {
        let samples: Vec<i16> = (0..frames * 2).map(|i| ((i % 200) as i16) - 100).collect();
        wav_from_samples(&samples, 44100, 2)
    }

    fn buffered(path: &str, frames: usize) -> PreloadedTrack {
        PreloadedTrack {
            path: PathBuf::from(path),
            buffer: Some(tone(frames)),
            sample_rate: 44100,
            channels: 2,
            duration: Duration::ZERO,
            format: PreloadFormat::CustomBuffer,
            tags: TrackTags::default(),
        }
    }

    #[test]
    fn test_load_file_and_metadata_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, tone(44100)).unwrap();

        let mut engine = engine();
        engine.load(&path).unwrap();
        assert_eq!(engine.state(), PlaybackState::Loaded);

        let info = engine.track_info();
        assert_eq!(info.title, "tone");
        assert_eq!(info.artist, UNKNOWN_ARTIST);
        assert_eq!(info.album, UNKNOWN_ALBUM);
        assert_eq!(info.duration, Duration::from_secs(1));
        assert_eq!(info.position, Duration::ZERO);
    }

    #[test]
    fn test_failed_load_leaves_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.wav");
        std::fs::write(&good, tone(4410)).unwrap();
        let bad = dir.path().join("bad.wav");
        std::fs::write(&bad, b"not audio at all").unwrap();

        let mut engine = engine();
        engine.load(&good).unwrap();
        engine.play().unwrap();

        let err = engine.load(&bad).unwrap_err();
        assert!(matches!(err, PlaybackError::Open { .. }));
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.track_info(), &TrackInfo::default());
        assert!(!engine.mixer().has_music());

        assert!(engine.load(&dir.path().join("missing.wav")).is_err());
        assert!(matches!(engine.play(), Err(PlaybackError::NotLoaded)));
    }

    #[test]
    fn test_volume_clamps_and_maps() {
        let mut engine = engine();
        engine.set_volume(150);
        assert_eq!(engine.volume(), 100);
        assert_eq!(engine.mixer().volume(), MAX_VOLUME);

        engine.set_volume(-5);
        assert_eq!(engine.volume(), 0);
        assert_eq!(engine.mixer().volume(), 0);

        engine.set_volume(50);
        assert_eq!(engine.mixer().volume(), 64);
    }

    #[test]
    fn test_position_follows_wall_clock_across_pause() {
        let mut engine = engine();
        engine.load_preloaded(buffered("song.flac", 44100 * 10)).unwrap();
        assert_eq!(engine.track_info().duration, Duration::from_secs(10));

        let t0 = Instant::now();
        engine.play_at(t0).unwrap();
        engine.update_at(t0 + Duration::from_secs(2));
        assert_eq!(engine.track_info().position, Duration::from_secs(2));

        engine.pause_at(t0 + Duration::from_secs(2));
        engine.update_at(t0 + Duration::from_secs(5));
        assert_eq!(engine.track_info().position, Duration::from_secs(2));
        assert!(engine.mixer().is_paused());

        // 暂停的 3 秒不计入
        engine.play_at(t0 + Duration::from_secs(5)).unwrap();
        engine.update_at(t0 + Duration::from_secs(6));
        assert_eq!(engine.track_info().position, Duration::from_secs(3));

        // 不超过总时长
        engine.update_at(t0 + Duration::from_secs(60));
        assert_eq!(engine.track_info().position, Duration::from_secs(10));
    }

    #[test]
    fn test_seek_reanchors_position() {
        let mut engine = engine();
        assert!(matches!(
            engine.seek_absolute(Duration::from_secs(1)),
            Err(PlaybackError::NotLoaded)
        ));

        engine.load_preloaded(buffered("song.flac", 44100 * 4)).unwrap();
        let t0 = Instant::now();
        engine.play_at(t0).unwrap();

        engine.seek_at(Duration::from_millis(1500), t0).unwrap();
        engine.update_at(t0 + Duration::from_secs(1));
        assert_eq!(engine.track_info().position, Duration::from_millis(2500));

        engine.seek_relative(-10.0).unwrap();
        assert_eq!(engine.track_info().position, Duration::ZERO);
    }

    #[test]
    fn test_seek_past_end_clamps_to_duration() {
        let mut engine = engine();
        engine.load_preloaded(buffered("song.flac", 44100)).unwrap();
        engine.play().unwrap();

        engine.seek_relative(f64::INFINITY).unwrap();
        assert_eq!(engine.track_info().position, Duration::from_secs(1));

        engine.seek_absolute(Duration::ZERO).unwrap();
        engine.seek_relative(1e20).unwrap();
        assert_eq!(engine.track_info().position, Duration::from_secs(1));

        engine.seek_absolute(Duration::from_secs(30)).unwrap();
        assert_eq!(engine.track_info().position, Duration::from_secs(1));

        engine.seek_relative(f64::NEG_INFINITY).unwrap();
        assert_eq!(engine.track_info().position, Duration::ZERO);

        assert!(matches!(
            engine.seek_relative(f64::NAN),
            Err(PlaybackError::InvalidSeek(_))
        ));
        assert_eq!(engine.track_info().position, Duration::ZERO);
    }

    #[test]
    fn test_load_mp3_estimates_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        // 128 kbps / 44.1 kHz CBR，每帧 417 字节
        let mut mp3 = Vec::new();
        for _ in 0..200 {
            mp3.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x40]);
            mp3.extend(std::iter::repeat(0u8).take(413));
        }
        std::fs::write(&path, &mp3).unwrap();

        let mut engine = engine();
        engine.load(&path).unwrap();
        let info = engine.track_info();
        assert_eq!(info.title, "a");
        assert_eq!(info.artist, UNKNOWN_ARTIST);
        assert!(!info.duration.is_zero());

        // 容器不报时长时退回到按码率估算
        let no_duration = AudioInfo {
            sample_rate: 44100,
            channels: 2,
            duration: None,
            codec: String::new(),
        };
        let estimated = probe_duration(&path, &no_duration);
        assert_eq!(estimated, lumen_format::estimate_file_duration(&path).unwrap());
        assert!((estimated.as_secs_f64() - 200.0 * 417.0 * 8.0 / 128_000.0).abs() < 0.01);

        let renamed = dir.path().join("a.bin");
        std::fs::write(&renamed, &mp3).unwrap();
        assert_eq!(probe_duration(&renamed, &no_duration), Duration::ZERO);
    }

    #[test]
    fn test_seek_while_paused_keeps_target() {
        let mut engine = engine();
        engine.load_preloaded(buffered("song.flac", 44100 * 4)).unwrap();
        let t0 = Instant::now();
        engine.play_at(t0).unwrap();
        engine.pause_at(t0 + Duration::from_secs(1));

        engine.seek_at(Duration::from_secs(3), t0 + Duration::from_secs(2)).unwrap();
        engine.play_at(t0 + Duration::from_secs(5)).unwrap();
        engine.update_at(t0 + Duration::from_secs(5));
        assert_eq!(engine.track_info().position, Duration::from_secs(3));
    }

    #[test]
    fn test_rejected_preload_returns_buffer() {
        let mut engine = engine();
        let mut track = buffered("broken.flac", 10);
        track.buffer = Some(vec![1, 2, 3]);

        let rejected = engine.load_preloaded(track).unwrap_err();
        assert!(matches!(rejected.error, PlaybackError::Buffer(_)));
        assert_eq!(rejected.track.buffer, Some(vec![1, 2, 3]));
        assert_eq!(engine.state(), PlaybackState::Stopped);

        let mut empty = buffered("empty.flac", 10);
        empty.buffer = None;
        let rejected = engine.load_preloaded(empty).unwrap_err();
        assert!(matches!(rejected.error, PlaybackError::MissingBuffer));
    }

    #[test]
    fn test_finished_after_source_drains() {
        let mut engine = engine();
        engine.load_preloaded(buffered("short.flac", 100)).unwrap();
        engine.play().unwrap();
        assert!(!engine.is_finished());

        let mut out = [0i16; 512];
        engine.mixer().mix(&mut out);
        assert!(engine.is_finished());

        engine.stop();
        assert!(!engine.is_finished());
        assert_eq!(engine.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_toggle_pause() {
        let mut engine = engine();
        engine.load_preloaded(buffered("song.flac", 4410)).unwrap();
        engine.toggle_pause().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);
        engine.toggle_pause().unwrap();
        assert_eq!(engine.state(), PlaybackState::Paused);
        engine.toggle_pause().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_stream_is_not_seekable() {
        let mut engine = engine();
        engine.begin_stream("pipe");
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert!(engine.is_streaming());
        assert!(!engine.is_finished());
        assert!(matches!(
            engine.seek_absolute(Duration::ZERO),
            Err(PlaybackError::NotSeekable)
        ));
        assert!(matches!(
            engine.seek_relative(f64::INFINITY),
            Err(PlaybackError::NotSeekable)
        ));
    }
}
