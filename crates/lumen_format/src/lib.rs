//! lumen_format - 播放管线使用的二进制格式
//!
//! 包含内存中交接 PCM 用的 44 字节 WAV 头，以及 MPEG 音频帧头解析（用于估算时长）。

mod mpeg;
mod wav;

pub use mpeg::*;
pub use wav::*;

/// 格式错误
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid RIFF/WAVE magic")]
    InvalidMagic,

    #[error("Unsupported WAV encoding: {0}")]
    UnsupportedEncoding(u16),

    #[error("Unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("Corrupt header: {0}")]
    CorruptHeader(&'static str),

    #[error("No MPEG audio frame found")]
    NoFrameSync,

    #[error("Free-format MPEG bitrate is not supported")]
    FreeFormatBitrate,
}
