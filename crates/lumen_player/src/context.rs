//! 音频上下文
//!
//! 持有一套完整的播放管线：混音器、播放引擎、预加载器、均衡器、可选的管道流
//! 和可选的输出设备。均衡器在构造时注册为混音后钩子，所有音源都经过它。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    AudioOutput, Equalizer, Mixer, OutputConfig, OutputError, PcmSource, PipelineConfig,
    PlaybackEngine, PlaybackError, PlaybackState, Preloader, PumpStatus, StreamError,
    StreamingReader, VirtualTrack,
};

/// 一次 update 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Playing,
    /// 当前文件曲目播完，调用方应切到下一首
    TrackFinished,
    Stream(PumpStatus),
}

pub struct AudioContext {
    config: PipelineConfig,
    engine: PlaybackEngine,
    preloader: Preloader,
    equalizer: Equalizer,
    stream: Option<VirtualTrack>,
    output: Option<AudioOutput>,
    /// 已经为哪一首发起过预加载
    preload_requested: Option<PathBuf>,
}

impl AudioContext {
    /// 不打开输出设备，混音器由调用方或 [`open_output`](Self::open_output) 驱动
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_preloader(config, Preloader::new())
    }

    pub fn with_preloader(config: PipelineConfig, preloader: Preloader) -> Self {
        let mixer = Arc::new(Mixer::new(config.sample_rate));
        let equalizer = Equalizer::new(config.sample_rate);

        let mut processor = equalizer.processor();
        mixer.set_post_mix(Some(Box::new(move |buf: &mut [i16]| processor.process(buf))));

        let mut engine = PlaybackEngine::new(mixer);
        engine.set_volume(config.initial_volume as i32);

        Self {
            config,
            engine,
            preloader,
            equalizer,
            stream: None,
            output: None,
            preload_requested: None,
        }
    }

    /// 打开默认输出设备
    pub fn open_output(&mut self) -> Result<(), OutputError> {
        let output = AudioOutput::new(
            self.engine.mixer().clone(),
            OutputConfig::from(&self.config),
        )?;
        self.output = Some(output);
        Ok(())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PlaybackEngine {
        &mut self.engine
    }

    pub fn equalizer(&self) -> &Equalizer {
        &self.equalizer
    }

    pub fn equalizer_mut(&mut self) -> &mut Equalizer {
        &mut self.equalizer
    }

    pub fn preloader(&self) -> &Preloader {
        &self.preloader
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        self.engine.mixer()
    }

    /// 切到下一首并开始播放：预加载命中时直接装载，否则同步加载
    pub fn advance_to(&mut self, path: &Path) -> Result<(), PlaybackError> {
        self.stop_stream();
        self.preload_requested = None;

        match self.preloader.consume(path) {
            Some(track) => match self.engine.load_preloaded(track) {
                Ok(()) => log::debug!("gapless advance to {:?}", path),
                Err(rejected) => {
                    log::warn!("preloaded track unusable, loading directly: {}", rejected);
                    drop(rejected.track);
                    self.engine.load(path)?;
                }
            },
            None => self.engine.load(path)?,
        }

        self.engine.play()
    }

    /// 每个 UI tick 调用一次
    ///
    /// `upcoming` 是队列里的下一首；当前曲目进入预加载提前量时开始预加载它。
    pub fn update(&mut self, upcoming: Option<&Path>) -> Tick {
        self.engine.update();

        if let Some(track) = self.stream.as_mut() {
            let status = track.pump(self.engine.mixer());
            if status == PumpStatus::Ended {
                log::info!("stream finished");
                self.stop_stream();
                self.engine.stop();
            }
            return Tick::Stream(status);
        }

        if let Some(next) = upcoming {
            self.maybe_preload(next);
        }

        if self.engine.is_finished() {
            Tick::TrackFinished
        } else if self.engine.state() == PlaybackState::Playing {
            Tick::Playing
        } else {
            Tick::Idle
        }
    }

    fn maybe_preload(&mut self, next: &Path) {
        if self.engine.state() == PlaybackState::Stopped {
            return;
        }
        if self.preload_requested.as_deref() == Some(next) {
            return;
        }

        // 时长未知时立即预加载
        let near_end = self
            .engine
            .remaining()
            .map_or(true, |left| left.as_secs_f64() <= self.config.preload_lead_secs);
        if near_end {
            self.preloader.start(next);
            self.preload_requested = Some(next.to_path_buf());
        }
    }

    /// 按配置创建管道流读取器
    pub fn stream_reader(&self, source: Arc<dyn PcmSource>) -> StreamingReader {
        StreamingReader::new(source, &self.config.stream, self.config.sample_rate)
    }

    /// 停掉文件播放，改播管道流
    pub fn play_stream(&mut self, reader: StreamingReader) -> Result<(), StreamError> {
        self.stop_stream();
        self.preloader.cancel();
        self.preload_requested = None;

        let mut track = VirtualTrack::new(reader, self.config.stream.chunk_secs);
        track.start()?;
        self.engine.begin_stream("Stream");
        self.stream = Some(track);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    fn stop_stream(&mut self) {
        if let Some(mut track) = self.stream.take() {
            track.stop();
        }
    }

    /// 停止一切播放
    pub fn stop(&mut self) {
        self.stop_stream();
        self.preloader.cancel();
        self.preload_requested = None;
        self.engine.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{preload_buffered, ChannelSource, DecoderError, PreloadState, PreloadedTrack, TrackDecoder};
    use crossbeam_channel::unbounded;
    use lumen_format::wav_from_samples;
    use std::time::{Duration, Instant};

    /// 所有格式都完整解码，便于用 WAV 走缓冲路径
    struct BufferAll;

    impl TrackDecoder for BufferAll {
        fn decode(&self, path: &Path) -> Result<PreloadedTrack, DecoderError> {
            preload_buffered(path)
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn write_tone(dir: &Path, name: &str, frames: usize, value: i16) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, wav_from_samples(&vec![value; frames * 2], 44100, 2)).unwrap();
        path
    }

    fn context() -> AudioContext {
        let mut config = PipelineConfig::default();
        config.initial_volume = 100;
        AudioContext::with_preloader(config, Preloader::with_decoder(BufferAll))
    }

    #[test]
    fn test_gapless_advance_uses_preload() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tone(dir.path(), "a.wav", 44100, 100);
        let b = write_tone(dir.path(), "b.wav", 44100, 200);

        let mut ctx = context();
        ctx.advance_to(&a).unwrap();
        assert_eq!(ctx.engine().state(), PlaybackState::Playing);

        // 1 秒的曲目已在提前量内
        assert_eq!(ctx.update(Some(&b)), Tick::Playing);
        wait_for(|| ctx.preloader().is_ready());

        ctx.advance_to(&b).unwrap();
        assert_eq!(ctx.preloader().state(), PreloadState::Idle);
        assert_eq!(ctx.engine().track_info().title, "b");
        assert_eq!(ctx.engine().track_info().duration, Duration::from_secs(1));

        let mut out = [0i16; 8];
        ctx.mixer().mix(&mut out);
        assert_eq!(out, [200; 8]);
    }

    #[test]
    fn test_advance_falls_back_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tone(dir.path(), "a.wav", 4410, 100);
        let b = write_tone(dir.path(), "b.wav", 4410, 200);
        let c = write_tone(dir.path(), "c.wav", 4410, 300);

        let mut ctx = context();
        ctx.advance_to(&a).unwrap();
        ctx.update(Some(&b));
        wait_for(|| ctx.preloader().is_ready());

        // 队列跳过了 b
        ctx.advance_to(&c).unwrap();
        assert_eq!(ctx.engine().track_info().title, "c");
        assert!(ctx.preloader().is_ready());

        assert!(ctx.advance_to(&dir.path().join("nope.wav")).is_err());
        assert_eq!(ctx.engine().state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_finished_track_reported() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tone(dir.path(), "a.wav", 100, 100);

        let mut ctx = context();
        ctx.advance_to(&a).unwrap();
        let mut out = [0i16; 1024];
        ctx.mixer().mix(&mut out);
        assert_eq!(ctx.update(None), Tick::TrackFinished);
    }

    #[test]
    fn test_equalizer_hooked_into_mixer() {
        let dir = tempfile::tempdir().unwrap();
        let samples: Vec<i16> = (0..4410)
            .flat_map(|i| {
                let s = ((i as f64 * 2.0 * std::f64::consts::PI * 1000.0 / 44100.0).sin() * 8000.0)
                    as i16;
                [s, s]
            })
            .collect();
        let path = dir.path().join("sine.wav");
        std::fs::write(&path, wav_from_samples(&samples, 44100, 2)).unwrap();

        let mut ctx = context();
        ctx.advance_to(&path).unwrap();
        let mut flat = vec![0i16; 2048];
        ctx.mixer().mix(&mut flat);
        assert_eq!(&flat[..], &samples[..2048]);

        ctx.equalizer_mut().set_band_db(2, 12);
        ctx.engine_mut().seek_absolute(Duration::ZERO).unwrap();
        let mut boosted = vec![0i16; 2048];
        ctx.mixer().mix(&mut boosted);
        assert_ne!(flat, boosted);
    }

    #[test]
    fn test_stream_plays_to_end() {
        let mut ctx = context();
        let (tx, rx) = unbounded();
        let reader = ctx.stream_reader(Arc::new(ChannelSource::new(rx)));
        ctx.play_stream(reader).unwrap();
        assert!(ctx.is_streaming());
        assert_eq!(ctx.update(None), Tick::Stream(PumpStatus::Buffering));

        // 3 秒，超过预缓冲阈值
        tx.send(vec![0u8; 176_400 * 3]).unwrap();
        drop(tx);
        wait_for(|| ctx.stream.as_ref().is_some_and(|t| t.reader().is_eof()));

        let mut out = vec![0i16; 44100];
        let mut last = Tick::Idle;
        for _ in 0..20 {
            last = ctx.update(None);
            if last == Tick::Stream(PumpStatus::Ended) {
                break;
            }
            ctx.mixer().mix(&mut out);
        }
        assert_eq!(last, Tick::Stream(PumpStatus::Ended));
        assert!(!ctx.is_streaming());
        assert_eq!(ctx.engine().state(), PlaybackState::Stopped);
    }
}
