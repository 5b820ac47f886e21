//! 44 字节 WAV 头
//!
//! 只用于把内存里的 PCM 交给混音器，不是持久化格式。

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::FormatError;

pub const RIFF_MAGIC: [u8; 4] = *b"RIFF";
pub const WAVE_MAGIC: [u8; 4] = *b"WAVE";
pub const FMT_MAGIC: [u8; 4] = *b"fmt ";
pub const DATA_MAGIC: [u8; 4] = *b"data";
pub const WAV_HEADER_LEN: usize = 44;

const FMT_CHUNK_LEN: u32 = 16;
const WAVE_FORMAT_PCM: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;

/// 规范 PCM WAV 头（RIFF + fmt + data，共 44 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// data chunk 的字节数
    pub data_len: u32,
}

impl WavHeader {
    /// 16-bit PCM 头
    pub fn pcm16(sample_rate: u32, channels: u16, data_len: u32) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: BITS_PER_SAMPLE,
            data_len,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// data 部分对应的时长（秒）
    pub fn duration_secs(&self) -> f64 {
        let rate = self.byte_rate();
        if rate == 0 {
            return 0.0;
        }
        self.data_len as f64 / rate as f64
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, FormatError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != RIFF_MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        let _riff_len = r.read_u32::<LittleEndian>()?;
        r.read_exact(&mut magic)?;
        if magic != WAVE_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        r.read_exact(&mut magic)?;
        if magic != FMT_MAGIC {
            return Err(FormatError::CorruptHeader("expected fmt chunk"));
        }
        let fmt_len = r.read_u32::<LittleEndian>()?;
        if fmt_len != FMT_CHUNK_LEN {
            return Err(FormatError::CorruptHeader("fmt chunk length != 16"));
        }

        let encoding = r.read_u16::<LittleEndian>()?;
        if encoding != WAVE_FORMAT_PCM {
            return Err(FormatError::UnsupportedEncoding(encoding));
        }
        let channels = r.read_u16::<LittleEndian>()?;
        let sample_rate = r.read_u32::<LittleEndian>()?;
        let _byte_rate = r.read_u32::<LittleEndian>()?;
        let _block_align = r.read_u16::<LittleEndian>()?;
        let bits_per_sample = r.read_u16::<LittleEndian>()?;
        if bits_per_sample != BITS_PER_SAMPLE {
            return Err(FormatError::UnsupportedBitDepth(bits_per_sample));
        }
        if channels == 0 {
            return Err(FormatError::CorruptHeader("zero channels"));
        }

        r.read_exact(&mut magic)?;
        if magic != DATA_MAGIC {
            return Err(FormatError::CorruptHeader("expected data chunk"));
        }
        let data_len = r.read_u32::<LittleEndian>()?;

        Ok(Self {
            sample_rate,
            channels,
            bits_per_sample,
            data_len,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), FormatError> {
        w.write_all(&RIFF_MAGIC)?;
        w.write_u32::<LittleEndian>(36 + self.data_len)?;
        w.write_all(&WAVE_MAGIC)?;
        w.write_all(&FMT_MAGIC)?;
        w.write_u32::<LittleEndian>(FMT_CHUNK_LEN)?;
        w.write_u16::<LittleEndian>(WAVE_FORMAT_PCM)?;
        w.write_u16::<LittleEndian>(self.channels)?;
        w.write_u32::<LittleEndian>(self.sample_rate)?;
        w.write_u32::<LittleEndian>(self.byte_rate())?;
        w.write_u16::<LittleEndian>(self.block_align())?;
        w.write_u16::<LittleEndian>(self.bits_per_sample)?;
        w.write_all(&DATA_MAGIC)?;
        w.write_u32::<LittleEndian>(self.data_len)?;
        Ok(())
    }

    /// 转换为字节数组
    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN] {
        let mut out = [0u8; WAV_HEADER_LEN];
        out[0..4].copy_from_slice(&RIFF_MAGIC);
        out[4..8].copy_from_slice(&(36 + self.data_len).to_le_bytes());
        out[8..12].copy_from_slice(&WAVE_MAGIC);
        out[12..16].copy_from_slice(&FMT_MAGIC);
        out[16..20].copy_from_slice(&FMT_CHUNK_LEN.to_le_bytes());
        out[20..22].copy_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
        out[22..24].copy_from_slice(&self.channels.to_le_bytes());
        out[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&self.byte_rate().to_le_bytes());
        out[32..34].copy_from_slice(&self.block_align().to_le_bytes());
        out[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(&DATA_MAGIC);
        out[40..44].copy_from_slice(&self.data_len.to_le_bytes());
        out
    }
}

/// 把 16-bit 交错采样打包成完整的 WAV 字节（头 + PCM）
pub fn wav_from_samples(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = samples.len() * 2;
    let header = WavHeader::pcm16(sample_rate, channels, data_len as u32);

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data_len);
    out.extend_from_slice(&header.to_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
