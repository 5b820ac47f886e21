//! 管线配置
//!
//! 所有字段都有默认值，JSON 文件里只需要写想覆盖的部分。

use std::path::Path;

use serde::{Deserialize, Serialize};

/// 固定输出格式：16-bit 立体声
pub const OUTPUT_CHANNELS: u16 = 2;
pub const BYTES_PER_FRAME: usize = OUTPUT_CHANNELS as usize * 2;
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// 配置错误
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// 播放管线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 混音器输出采样率（不做重采样）
    pub sample_rate: u32,
    /// 输出设备缓冲大小（帧）
    pub output_buffer_frames: u32,
    /// 初始音量 (0 - 100)
    pub initial_volume: u8,
    /// 距离曲目结束多少秒时开始预加载下一首
    pub preload_lead_secs: f64,
    pub stream: StreamSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            output_buffer_frames: 1024,
            initial_volume: 100,
            preload_lead_secs: 10.0,
            stream: StreamSettings::default(),
        }
    }
}

/// 管道流读取配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// 环形缓冲容量（秒）
    pub buffer_secs: f64,
    /// 开始播放前需要缓冲的秒数
    pub prebuffer_secs: f64,
    /// 超过这个时间没有收到数据即视为停滞
    pub stall_timeout_secs: f64,
    /// 工作线程单次读取的字节数
    pub read_chunk_bytes: usize,
    /// 每次交给混音器的块时长（秒）
    pub chunk_secs: f64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer_secs: 10.0,
            prebuffer_secs: 2.0,
            stall_timeout_secs: 3.0,
            read_chunk_bytes: 4096,
            chunk_secs: 1.0,
        }
    }
}

impl StreamSettings {
    /// 每秒 PCM 字节数
    pub fn bytes_per_sec(sample_rate: u32) -> usize {
        sample_rate as usize * BYTES_PER_FRAME
    }

    /// 秒数换算为字节数，按整帧对齐
    pub fn secs_to_bytes(secs: f64, sample_rate: u32) -> usize {
        let raw = (secs.max(0.0) * Self::bytes_per_sec(sample_rate) as f64) as usize;
        raw - raw % BYTES_PER_FRAME
    }
}

impl PipelineConfig {
    /// 从 JSON 文件读取配置
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "sample_rate",
                reason: "must be positive",
            });
        }
        if self.output_buffer_frames == 0 {
            return Err(ConfigError::Invalid {
                field: "output_buffer_frames",
                reason: "must be positive",
            });
        }
        if self.initial_volume > 100 {
            return Err(ConfigError::Invalid {
                field: "initial_volume",
                reason: "must be within 0..=100",
            });
        }
        let stream = &self.stream;
        if stream.buffer_secs <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "stream.buffer_secs",
                reason: "must be positive",
            });
        }
        if stream.prebuffer_secs < 0.0 || stream.prebuffer_secs > stream.buffer_secs {
            return Err(ConfigError::Invalid {
                field: "stream.prebuffer_secs",
                reason: "must fit inside the ring buffer",
            });
        }
        if stream.read_chunk_bytes == 0 || stream.chunk_secs <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "stream",
                reason: "chunk sizes must be positive",
            });
        }
        Ok(())
    }
}
