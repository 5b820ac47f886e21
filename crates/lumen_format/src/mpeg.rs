//! MPEG 音频帧头解析
//!
//! 只解析第一帧的比特率，用文件大小估算时长。假设恒定码率：VBR 文件会有偏差。

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use crate::FormatError;

const ID3V2_HEADER_LEN: usize = 10;
const ID3V1_TAG_LEN: u64 = 128;
/// 在 ID3 标签之后最多扫描多少字节寻找帧同步
const SYNC_SCAN_WINDOW: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    V1,
    V2,
    V2_5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegLayer {
    Layer1,
    Layer2,
    Layer3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Stereo,
    JointStereo,
    DualChannel,
    Mono,
}

const BITRATES_V1_L1: [u32; 16] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0];
const BITRATES_V1_L2: [u32; 16] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0];
const BITRATES_V1_L3: [u32; 16] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0];
const BITRATES_V2_L1: [u32; 16] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0];
const BITRATES_V2_L23: [u32; 16] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0];

/// MPEG 音频帧头 (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub layer: MpegLayer,
    /// kbit/s，0 表示 free format
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channel_mode: ChannelMode,
}

impl FrameHeader {
    /// 解析 4 字节帧头，不是合法帧头时返回 None
    pub fn parse(bytes: [u8; 4]) -> Option<Self> {
        let word = u32::from_be_bytes(bytes);
        if word >> 21 != 0x7FF {
            return None;
        }

        let version = match (word >> 19) & 0b11 {
            0b00 => MpegVersion::V2_5,
            0b10 => MpegVersion::V2,
            0b11 => MpegVersion::V1,
            _ => return None,
        };
        let layer = match (word >> 17) & 0b11 {
            0b01 => MpegLayer::Layer3,
            0b10 => MpegLayer::Layer2,
            0b11 => MpegLayer::Layer1,
            _ => return None,
        };

        let bitrate_index = ((word >> 12) & 0xF) as usize;
        if bitrate_index == 0xF {
            return None;
        }
        let table = match (version, layer) {
            (MpegVersion::V1, MpegLayer::Layer1) => &BITRATES_V1_L1,
            (MpegVersion::V1, MpegLayer::Layer2) => &BITRATES_V1_L2,
            (MpegVersion::V1, MpegLayer::Layer3) => &BITRATES_V1_L3,
            (_, MpegLayer::Layer1) => &BITRATES_V2_L1,
            (_, _) => &BITRATES_V2_L23,
        };
        let bitrate_kbps = table[bitrate_index];

        let sample_rate_index = (word >> 10) & 0b11;
        let base_rate = match sample_rate_index {
            0 => 44100,
            1 => 48000,
            2 => 32000,
            _ => return None,
        };
        let sample_rate = match version {
            MpegVersion::V1 => base_rate,
            MpegVersion::V2 => base_rate / 2,
            MpegVersion::V2_5 => base_rate / 4,
        };

        let padding = (word >> 9) & 1 == 1;
        let channel_mode = match (word >> 6) & 0b11 {
            0b00 => ChannelMode::Stereo,
            0b01 => ChannelMode::JointStereo,
            0b10 => ChannelMode::DualChannel,
            _ => ChannelMode::Mono,
        };

        Some(Self {
            version,
            layer,
            bitrate_kbps,
            sample_rate,
            padding,
            channel_mode,
        })
    }

    /// 帧长度（字节，含帧头）。free format 返回 None
    pub fn frame_len(&self) -> Option<usize> {
        if self.bitrate_kbps == 0 {
            return None;
        }
        let bitrate = self.bitrate_kbps as usize * 1000;
        let rate = self.sample_rate as usize;
        let pad = self.padding as usize;

        let len = match (self.layer, self.version) {
            (MpegLayer::Layer1, _) => (12 * bitrate / rate + pad) * 4,
            (MpegLayer::Layer3, MpegVersion::V2 | MpegVersion::V2_5) => 72 * bitrate / rate + pad,
            _ => 144 * bitrate / rate + pad,
        };
        Some(len)
    }
}

/// 从 ID3v2 头计算标签总长度（含 10 字节头与可选 footer）
pub fn id3v2_len(header: &[u8]) -> Option<u64> {
    if header.len() < ID3V2_HEADER_LEN || &header[0..3] != b"ID3" {
        return None;
    }
    // syncsafe 整数：每字节只用低 7 位
    let size = header[6..10]
        .iter()
        .fold(0u64, |acc, b| (acc << 7) | (*b as u64 & 0x7F));
    let footer = if header[5] & 0x10 != 0 { 10 } else { 0 };
    Some(ID3V2_HEADER_LEN as u64 + size + footer)
}

/// 在流中寻找第一个 MPEG 音频帧，返回 (偏移, 帧头)
pub fn find_first_frame<R: Read + Seek>(r: &mut R) -> Result<(u64, FrameHeader), FormatError> {
    r.seek(SeekFrom::Start(0))?;
    let mut id3 = [0u8; ID3V2_HEADER_LEN];
    let mut start = 0u64;
    if read_full(r, &mut id3)? == ID3V2_HEADER_LEN {
        if let Some(len) = id3v2_len(&id3) {
            start = len;
        }
    }

    r.seek(SeekFrom::Start(start))?;
    let mut window = vec![0u8; SYNC_SCAN_WINDOW];
    let filled = read_full(r, &mut window)?;
    window.truncate(filled);

    for i in 0..window.len().saturating_sub(3) {
        if window[i] != 0xFF {
            continue;
        }
        let Some(header) = FrameHeader::parse([window[i], window[i + 1], window[i + 2], window[i + 3]])
        else {
            continue;
        };

        // 下一帧也在窗口内时再校验一次，排除数据里偶然出现的同步字
        if let Some(next) = header.frame_len().map(|len| i + len) {
            if next + 4 <= window.len() {
                let follow = [window[next], window[next + 1], window[next + 2], window[next + 3]];
                if FrameHeader::parse(follow).is_none() {
                    continue;
                }
            }
        }

        return Ok((start + i as u64, header));
    }

    Err(FormatError::NoFrameSync)
}

/// 按第一帧比特率估算时长：音频字节数 × 8 / 比特率
pub fn estimate_duration<R: Read + Seek>(r: &mut R) -> Result<Duration, FormatError> {
    let (offset, header) = find_first_frame(r)?;
    if header.bitrate_kbps == 0 {
        return Err(FormatError::FreeFormatBitrate);
    }

    let total = r.seek(SeekFrom::End(0))?;
    let mut end = total;
    if total >= offset + ID3V1_TAG_LEN {
        r.seek(SeekFrom::Start(total - ID3V1_TAG_LEN))?;
        let mut tag = [0u8; 3];
        r.read_exact(&mut tag)?;
        if &tag == b"TAG" {
            end -= ID3V1_TAG_LEN;
        }
    }

    let audio_bytes = end.saturating_sub(offset);
    let secs = audio_bytes as f64 * 8.0 / (header.bitrate_kbps as f64 * 1000.0);
    Ok(Duration::from_secs_f64(secs))
}

/// 打开文件并估算时长
pub fn estimate_file_duration(path: &Path) -> Result<Duration, FormatError> {
    let mut file = File::open(path)?;
    estimate_duration(&mut file)
}

/// 读取尽可能多的字节（处理短读）
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
