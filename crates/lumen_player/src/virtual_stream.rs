//! 虚拟曲目：把管道流的数据块接续排进混音器队列

use crate::{MemorySource, Mixer, StreamError, StreamingReader};

/// 当前块之外保持排队的块数
const QUEUE_AHEAD: usize = 1;

/// 一次泵送后的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// 等待预缓冲
    Buffering,
    Playing,
    /// 混音器已经播空，生产端也没有新数据
    Stalled,
    Ended,
}

pub struct VirtualTrack {
    reader: StreamingReader,
    chunk_secs: f64,
    started: bool,
    chunks_queued: u64,
}

impl VirtualTrack {
    pub fn new(reader: StreamingReader, chunk_secs: f64) -> Self {
        Self {
            reader,
            chunk_secs: chunk_secs.max(0.05),
            started: false,
            chunks_queued: 0,
        }
    }

    /// 启动底层读取线程
    pub fn start(&mut self) -> Result<(), StreamError> {
        self.reader.start()
    }

    pub fn stop(&mut self) {
        self.reader.stop();
    }

    pub fn reader(&self) -> &StreamingReader {
        &self.reader
    }

    pub fn chunks_queued(&self) -> u64 {
        self.chunks_queued
    }

    /// 每个 tick 调用一次：就绪后保持混音器队列里有数据
    pub fn pump(&mut self, mixer: &Mixer) -> PumpStatus {
        mixer.reap();

        if !self.started {
            let buffered = self.reader.buffered();
            let eof = self.reader.is_eof();
            // 流已结束时不足预缓冲量也播完
            if !self.reader.is_ready() && !(eof && buffered > 0) {
                return if eof {
                    PumpStatus::Ended
                } else {
                    PumpStatus::Buffering
                };
            }
            log::debug!(
                "stream: prebuffered {:.1}s, starting playback",
                self.reader.buffered_secs()
            );
            self.started = true;
        }

        while !mixer.has_music() || mixer.queued() < QUEUE_AHEAD {
            let Some(wav) = self.reader.get_chunk(self.chunk_secs) else {
                break;
            };
            match MemorySource::from_wav(wav) {
                Ok(source) => {
                    mixer.queue_music(Box::new(source));
                    self.chunks_queued += 1;
                }
                Err(e) => {
                    log::warn!("stream: dropping malformed chunk: {}", e);
                    break;
                }
            }
        }

        if !mixer.is_drained() {
            PumpStatus::Playing
        } else if self.reader.is_eof() && self.reader.buffered() == 0 {
            PumpStatus::Ended
        } else if self.reader.is_receiving() {
            PumpStatus::Buffering
        } else {
            PumpStatus::Stalled
        }
    }
}
