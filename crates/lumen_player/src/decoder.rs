//! 音频解码器
//!
//! 使用 symphonia 解码音频流，输出 16-bit 交错采样

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use lumen_format::wav_from_samples;

use crate::{Source, SourceError, TrackTags, OUTPUT_CHANNELS};

/// 解码器错误
#[derive(thiserror::Error, Debug)]
pub enum DecoderError {
    #[error("No supported audio track found")]
    NoTrack,
    #[error("Unsupported codec")]
    UnsupportedCodec,
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SymphoniaError> for DecoderError {
    fn from(e: SymphoniaError) -> Self {
        DecoderError::Decode(e.to_string())
    }
}

/// 音频信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: usize,
    pub duration: Option<Duration>,
    pub codec: String,
}

/// 音频解码器
pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_buf: Option<SampleBuffer<i16>>,
    /// 最近一次解码得到的声道数
    last_channels: usize,
    pub info: AudioInfo,
    pub tags: TrackTags,
}

impl AudioDecoder {
    /// 打开本地文件，扩展名作为探测提示
    pub fn open(path: &Path) -> Result<Self, DecoderError> {
        let file = File::open(path)?;
        let hint = path.extension().and_then(|e| e.to_str());
        Self::new(file, hint)
    }

    /// 从可读流创建解码器
    pub fn new<R: MediaSource + 'static>(source: R, hint: Option<&str>) -> Result<Self, DecoderError> {
        let mss = MediaSourceStream::new(Box::new(source), Default::default());

        let mut probe_hint = Hint::new();
        if let Some(ext) = hint {
            probe_hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(
                &probe_hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecoderError::Decode(e.to_string()))?;

        let tags = TrackTags::from_probe(&mut probed);
        let format = probed.format;

        // 查找第一个音频轨道
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecoderError::NoTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.unwrap_or(crate::DEFAULT_SAMPLE_RATE);
        let channels = codec_params.channels.map(|c| c.count()).unwrap_or(2);

        let duration = codec_params
            .n_frames
            .map(|frames| Duration::from_secs_f64(frames as f64 / sample_rate as f64));

        let info = AudioInfo {
            sample_rate,
            channels,
            duration,
            codec: format!("{:?}", codec_params.codec),
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|_| DecoderError::UnsupportedCodec)?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_buf: None,
            last_channels: channels,
            info,
            tags,
        })
    }

    /// 解码下一个包到内部缓冲，返回声道数；文件结束返回 None
    fn decode_packet(&mut self) -> Result<Option<usize>, DecoderError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            // 跳过非目标轨道
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 坏包跳过
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let spec = *decoded.spec();
            let capacity = decoded.capacity();

            let needed = capacity * spec.channels.count();
            if self.sample_buf.as_ref().map_or(true, |b| b.capacity() < needed) {
                self.sample_buf = Some(SampleBuffer::new(capacity as u64, spec));
            }
            if let Some(buf) = self.sample_buf.as_mut() {
                buf.copy_interleaved_ref(decoded);
            }

            self.last_channels = spec.channels.count();
            return Ok(Some(self.last_channels));
        }
    }

    /// 解码下一帧并以立体声追加到 `out`；文件结束返回 false
    pub fn decode_stereo_into(&mut self, out: &mut Vec<i16>) -> Result<bool, DecoderError> {
        let Some(channels) = self.decode_packet()? else {
            return Ok(false);
        };
        if let Some(buf) = &self.sample_buf {
            append_stereo(buf.samples(), channels, out);
        }
        Ok(true)
    }

    /// 跳转到指定时间
    pub fn seek(&mut self, time: Duration) -> Result<(), DecoderError> {
        let seek_to = SeekTo::Time {
            time: symphonia::core::units::Time::from(time.as_secs_f64()),
            track_id: Some(self.track_id),
        };

        self.format
            .seek(SeekMode::Accurate, seek_to)
            .map_err(|e| DecoderError::Decode(e.to_string()))?;

        // 重置解码器状态
        self.decoder.reset();

        Ok(())
    }
}

/// 任意声道数转为立体声：单声道复制，多声道取前两个
pub fn append_stereo(samples: &[i16], channels: usize, out: &mut Vec<i16>) {
    match channels {
        0 => {}
        1 => {
            out.reserve(samples.len() * 2);
            for s in samples {
                out.push(*s);
                out.push(*s);
            }
        }
        2 => out.extend_from_slice(samples),
        n => {
            for frame in samples.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
        }
    }
}

/// 一次性完整解码的结果（立体声）
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub tags: TrackTags,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / OUTPUT_CHANNELS as usize;
        Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64)
    }

    /// 包装成内存 WAV（44 字节头 + PCM）
    pub fn into_wav(self) -> Vec<u8> {
        wav_from_samples(&self.samples, self.sample_rate, OUTPUT_CHANNELS)
    }
}

/// 完整解码整个文件到内存
pub fn decode_all(path: &Path) -> Result<DecodedAudio, DecoderError> {
    let mut decoder = AudioDecoder::open(path)?;

    let mut samples = Vec::new();
    if let Some(duration) = decoder.info.duration {
        let frames = duration.as_secs_f64() * decoder.info.sample_rate as f64;
        samples.reserve(frames as usize * OUTPUT_CHANNELS as usize);
    }
    while decoder.decode_stereo_into(&mut samples)? {}

    Ok(DecodedAudio {
        samples,
        sample_rate: decoder.info.sample_rate,
        tags: decoder.tags,
    })
}

/// 边解码边播放的音源（混音器原生流式加载）
pub struct DecoderSource {
    decoder: AudioDecoder,
    pending: Vec<i16>,
    pending_pos: usize,
    finished: bool,
}

impl DecoderSource {
    pub fn new(decoder: AudioDecoder) -> Self {
        Self {
            decoder,
            pending: Vec::with_capacity(8192),
            pending_pos: 0,
            finished: false,
        }
    }
}

impl Source for DecoderSource {
    fn read(&mut self, out: &mut [i16]) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.pending_pos < self.pending.len() {
                let n = (out.len() - written).min(self.pending.len() - self.pending_pos);
                out[written..written + n]
                    .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                written += n;
                self.pending_pos += n;
                continue;
            }
            if self.finished {
                break;
            }

            self.pending.clear();
            self.pending_pos = 0;
            // 解码错误按结束处理
            match self.decoder.decode_stereo_into(&mut self.pending) {
                Ok(true) => {}
                Ok(false) | Err(_) => self.finished = true,
            }
        }
        written
    }

    fn seek(&mut self, secs: f64) -> Result<(), SourceError> {
        self.decoder.seek(Duration::from_secs_f64(secs.max(0.0)))?;
        self.pending.clear();
        self.pending_pos = 0;
        self.finished = false;
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.decoder.info.sample_rate
    }

    fn duration_secs(&self) -> Option<f64> {
        self.decoder.info.duration.map(|d| d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(dir: &Path, name: &str, frames: usize, channels: u16) -> std::path::PathBuf {
        let samples: Vec<i16> = (0..frames * channels as usize)
            .map(|i| ((i * 37) % 2000) as i16 - 1000)
            .collect();
        let path = dir.join(name);
        std::fs::write(&path, wav_from_samples(&samples, 44100, channels)).unwrap();
        path
    }

    #[test]
    fn test_decode_all_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "tone.wav", 4410, 2);

        let audio = decode_all(&path).unwrap();
        assert_eq!(audio.sample_rate, 44100);
        assert_eq!(audio.samples.len(), 4410 * 2);
        assert_eq!(audio.samples[0], -1000);
        assert!((audio.duration().as_secs_f64() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_mono_decodes_to_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "mono.wav", 1000, 1);

        let audio = decode_all(&path).unwrap();
        assert_eq!(audio.samples.len(), 2000);
        assert_eq!(audio.samples[0], audio.samples[1]);
        assert_eq!(audio.samples[2], audio.samples[3]);
    }

    #[test]
    fn test_decoder_source_seek() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "seek.wav", 44100, 2);

        let decoder = AudioDecoder::open(&path).unwrap();
        assert_eq!(decoder.info.duration, Some(Duration::from_secs(1)));
        let mut source = DecoderSource::new(decoder);

        let mut total = 0;
        let mut buf = [0i16; 1024];
        loop {
            let n = source.read(&mut buf);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 44100 * 2);

        source.seek(0.5).unwrap();
        let n = source.read(&mut buf);
        assert!(n > 0);
    }

    #[test]
    fn test_open_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.mp3");
        std::fs::write(&path, vec![0x55u8; 2048]).unwrap();
        assert!(AudioDecoder::open(&path).is_err());
        assert!(AudioDecoder::open(&dir.path().join("missing.wav")).is_err());
    }

    #[test]
    fn test_append_stereo_layouts() {
        let mut out = Vec::new();
        append_stereo(&[1, 2, 3, 4, 5, 6], 3, &mut out);
        assert_eq!(out, vec![1, 2, 4, 5]);

        out.clear();
        append_stereo(&[7, 8], 1, &mut out);
        assert_eq!(out, vec![7, 7, 8, 8]);
    }
}
