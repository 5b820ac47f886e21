//! 音频输出
//!
//! 使用 cpal 打开输出设备，回调直接从混音器取数据

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use crate::{Mixer, PipelineConfig, OUTPUT_CHANNELS};

/// 音频输出错误
#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    #[error("No output device available")]
    NoDevice,
    #[error("No supported config")]
    NoConfig,
    #[error("Stream error: {0}")]
    Stream(String),
}

/// 音频输出配置
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub sample_rate: u32,
    /// f32 设备转换用的暂存区大小（帧）
    pub buffer_frames: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            buffer_frames: 1024,
        }
    }
}

impl From<&PipelineConfig> for OutputConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            buffer_frames: config.output_buffer_frames as usize,
        }
    }
}

/// 音频输出流，析构时关闭
pub struct AudioOutput {
    _stream: Stream,
}

impl AudioOutput {
    /// 使用默认设备创建音频输出
    pub fn new(mixer: Arc<Mixer>, config: OutputConfig) -> Result<Self, OutputError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(OutputError::NoDevice)?;

        Self::with_device(&device, mixer, config)
    }

    /// 使用指定设备创建音频输出
    pub fn with_device(
        device: &Device,
        mixer: Arc<Mixer>,
        config: OutputConfig,
    ) -> Result<Self, OutputError> {
        let candidates: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| OutputError::Stream(e.to_string()))?
            .filter(|c| {
                c.channels() == OUTPUT_CHANNELS
                    && c.min_sample_rate().0 <= config.sample_rate
                    && c.max_sample_rate().0 >= config.sample_rate
            })
            .collect();

        // 优先 i16，省一次转换
        let supported = candidates
            .iter()
            .find(|c| c.sample_format() == SampleFormat::I16)
            .or_else(|| candidates.iter().find(|c| c.sample_format() == SampleFormat::F32))
            .cloned()
            .ok_or(OutputError::NoConfig)?;

        let sample_format = supported.sample_format();
        let stream_config: StreamConfig = supported
            .with_sample_rate(cpal::SampleRate(config.sample_rate))
            .into();

        let on_error = |err| log::error!("audio output error: {}", err);

        let stream = match sample_format {
            SampleFormat::I16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    mixer.mix(data);
                },
                on_error,
                None,
            ),
            _ => {
                // 预先分配暂存区，回调里不再分配
                let mut scratch = vec![0i16; config.buffer_frames.max(64) * OUTPUT_CHANNELS as usize];
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for chunk in data.chunks_mut(scratch.len()) {
                            let pcm = &mut scratch[..chunk.len()];
                            mixer.mix(pcm);
                            for (dst, src) in chunk.iter_mut().zip(pcm.iter()) {
                                *dst = *src as f32 / 32768.0;
                            }
                        }
                    },
                    on_error,
                    None,
                )
            }
        }
        .map_err(|e| OutputError::Stream(e.to_string()))?;

        stream.play().map_err(|e| OutputError::Stream(e.to_string()))?;

        log::info!(
            "audio output opened: {} Hz, {:?}",
            config.sample_rate,
            sample_format
        );

        Ok(Self { _stream: stream })
    }
}
