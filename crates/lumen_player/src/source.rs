//! 混音器音源
//!
//! 音源统一输出 16-bit 交错立体声。单声道在读取时复制到两个声道。

use std::io::Cursor;

use lumen_format::{WavHeader, WAV_HEADER_LEN};

use crate::DecoderError;

/// 音源错误
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("Format error: {0}")]
    Format(#[from] lumen_format::FormatError),

    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),

    #[error("WAV data shorter than header claims ({actual} < {expected})")]
    Truncated { expected: usize, actual: usize },

    #[error("No source loaded")]
    NoSource,
}

/// 混音器可播放的音源
pub trait Source: Send {
    /// 填充交错立体声采样，返回写入的采样数；返回 0 表示结束
    fn read(&mut self, out: &mut [i16]) -> usize;

    /// 跳转到指定秒数
    fn seek(&mut self, secs: f64) -> Result<(), SourceError>;

    fn sample_rate(&self) -> u32;

    /// 总时长（秒），未知时为 None
    fn duration_secs(&self) -> Option<f64>;
}

/// 内存中的 WAV 音源（44 字节头 + PCM）
///
/// 预加载完成的曲目和管道流的数据块都以这种形式交给混音器。
pub struct MemorySource {
    data: Vec<u8>,
    header: WavHeader,
    /// PCM 区读取位置（字节，相对 data chunk 起点）
    cursor: usize,
}

impl MemorySource {
    /// 接管一段完整的 WAV 字节
    pub fn from_wav(data: Vec<u8>) -> Result<Self, SourceError> {
        Self::try_from_wav(data).map_err(|(e, _)| e)
    }

    /// 同 [`from_wav`](Self::from_wav)，失败时交还字节
    pub fn try_from_wav(data: Vec<u8>) -> Result<Self, (SourceError, Vec<u8>)> {
        match Self::probe(&data) {
            Ok(header) => Ok(Self {
                data,
                header,
                cursor: 0,
            }),
            Err(e) => Err((e, data)),
        }
    }

    /// 校验 WAV 头，不取得所有权
    pub fn probe(data: &[u8]) -> Result<WavHeader, SourceError> {
        let header = WavHeader::read_from(&mut Cursor::new(data))?;
        let expected = WAV_HEADER_LEN + header.data_len as usize;
        if data.len() < expected {
            return Err(SourceError::Truncated {
                expected,
                actual: data.len(),
            });
        }
        Ok(header)
    }

    pub fn header(&self) -> &WavHeader {
        &self.header
    }

    fn pcm(&self) -> &[u8] {
        &self.data[WAV_HEADER_LEN..WAV_HEADER_LEN + self.header.data_len as usize]
    }

    fn frame_bytes(&self) -> usize {
        self.header.block_align() as usize
    }

    /// 剩余未播放的帧数
    pub fn remaining_frames(&self) -> usize {
        (self.header.data_len as usize - self.cursor) / self.frame_bytes()
    }
}

impl Source for MemorySource {
    fn read(&mut self, out: &mut [i16]) -> usize {
        let channels = self.header.channels as usize;
        let frame_bytes = self.frame_bytes();
        let frames = (out.len() / 2).min(self.remaining_frames());

        let start = self.cursor;
        let pcm = self.pcm();
        for (i, frame) in out.chunks_exact_mut(2).take(frames).enumerate() {
            let base = start + i * frame_bytes;
            let left = i16::from_le_bytes([pcm[base], pcm[base + 1]]);
            let right = if channels >= 2 {
                i16::from_le_bytes([pcm[base + 2], pcm[base + 3]])
            } else {
                left
            };
            frame[0] = left;
            frame[1] = right;
        }

        self.cursor += frames * frame_bytes;
        frames * 2
    }

    fn seek(&mut self, secs: f64) -> Result<(), SourceError> {
        let frame = (secs.max(0.0) * self.header.sample_rate as f64) as usize;
        let byte = frame.saturating_mul(self.frame_bytes());
        self.cursor = byte.min(self.header.data_len as usize);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.header.sample_rate
    }

    fn duration_secs(&self) -> Option<f64> {
        Some(self.header.duration_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_format::wav_from_samples;

    #[test]
    fn test_stereo_read() {
        let wav = wav_from_samples(&[1, 2, 3, 4, 5, 6], 44100, 2);
        let mut src = MemorySource::from_wav(wav).unwrap();

        let mut out = [0i16; 4];
        assert_eq!(src.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(src.read(&mut out), 2);
        assert_eq!(&out[..2], &[5, 6]);
        assert_eq!(src.read(&mut out), 0);
    }

    #[test]
    fn test_mono_is_duplicated() {
        let wav = wav_from_samples(&[10, -10, 20], 22050, 1);
        let mut src = MemorySource::from_wav(wav).unwrap();

        let mut out = [0i16; 8];
        assert_eq!(src.read(&mut out), 6);
        assert_eq!(&out[..6], &[10, 10, -10, -10, 20, 20]);
    }

    #[test]
    fn test_seek_clamps() {
        let samples: Vec<i16> = (0..44100 * 2).map(|i| (i % 1000) as i16).collect();
        let mut src = MemorySource::from_wav(wav_from_samples(&samples, 44100, 2)).unwrap();
        assert_eq!(src.duration_secs(), Some(1.0));

        src.seek(0.5).unwrap();
        assert_eq!(src.remaining_frames(), 22050);

        src.seek(30.0).unwrap();
        assert_eq!(src.remaining_frames(), 0);
        let mut out = [0i16; 16];
        assert_eq!(src.read(&mut out), 0);
    }

    #[test]
    fn test_truncated_wav_rejected() {
        let mut wav = wav_from_samples(&[1, 2, 3, 4], 44100, 2);
        wav.truncate(wav.len() - 2);
        let err = MemorySource::from_wav(wav).err().unwrap();
        assert!(matches!(err, SourceError::Truncated { expected: 52, actual: 50 }));
    }

    #[test]
    fn test_rejected_bytes_are_returned() {
        let garbage = vec![0xAB; 100];
        let (err, back) = MemorySource::try_from_wav(garbage.clone()).err().unwrap();
        assert!(matches!(err, SourceError::Format(_)));
        assert_eq!(back, garbage);
    }
}
