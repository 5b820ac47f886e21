//! 后台预加载
//!
//! 在当前曲目快结束时提前解码下一首，切歌时直接取用，实现无缝衔接。
//!
//! 共享状态只有请求路径、结果和状态枚举，由一把锁和一个条件变量保护；
//! 耗时的解码在锁外进行。同一时间只跟踪一个请求，新请求会取消旧请求。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{decode_all, AudioDecoder, DecoderError, TrackTags, OUTPUT_CHANNELS};

/// 预加载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreloadState {
    #[default]
    Idle,
    Loading,
    Ready,
    Cancelled,
}

/// 预加载结果的加载方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadFormat {
    /// 已完整解码到内存缓冲
    CustomBuffer,
    /// 混音器可直接流式加载，走普通文件加载
    Native,
}

impl PreloadFormat {
    /// WAV / MP3 / Ogg 可以边解码边播，其余格式提前完整解码
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("wav" | "wave" | "mp3" | "ogg" | "oga") => PreloadFormat::Native,
            _ => PreloadFormat::CustomBuffer,
        }
    }
}

/// 预加载完成的曲目
///
/// `buffer` 只在 [`PreloadFormat::CustomBuffer`] 时存在，是完整的内存 WAV。
#[derive(Debug)]
pub struct PreloadedTrack {
    pub path: PathBuf,
    pub buffer: Option<Vec<u8>>,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Duration,
    pub format: PreloadFormat,
    pub tags: TrackTags,
}

/// 预加载使用的解码器
pub trait TrackDecoder: Send + Sync + 'static {
    fn decode(&self, path: &Path) -> Result<PreloadedTrack, DecoderError>;
}

/// 基于 symphonia 的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaTrackDecoder;

impl TrackDecoder for SymphoniaTrackDecoder {
    fn decode(&self, path: &Path) -> Result<PreloadedTrack, DecoderError> {
        match PreloadFormat::for_path(path) {
            PreloadFormat::CustomBuffer => preload_buffered(path),
            PreloadFormat::Native => {
                // 只探测，确认文件可以打开
                let decoder = AudioDecoder::open(path)?;
                Ok(PreloadedTrack {
                    path: path.to_path_buf(),
                    buffer: None,
                    sample_rate: decoder.info.sample_rate,
                    channels: OUTPUT_CHANNELS,
                    duration: decoder.info.duration.unwrap_or(Duration::ZERO),
                    format: PreloadFormat::Native,
                    tags: decoder.tags,
                })
            }
        }
    }
}

/// 完整解码并包装成内存 WAV
pub fn preload_buffered(path: &Path) -> Result<PreloadedTrack, DecoderError> {
    let audio = decode_all(path)?;
    let duration = audio.duration();
    let sample_rate = audio.sample_rate;
    let tags = audio.tags.clone();

    Ok(PreloadedTrack {
        path: path.to_path_buf(),
        buffer: Some(audio.into_wav()),
        sample_rate,
        channels: OUTPUT_CHANNELS,
        duration,
        format: PreloadFormat::CustomBuffer,
        tags,
    })
}

#[derive(Default)]
struct Slot {
    state: PreloadState,
    request: Option<PathBuf>,
    /// 请求尚未被工作线程取走
    pending: bool,
    /// 工作线程正在解码
    in_flight: bool,
    /// 每次 start 递增，用来识别被取代的结果
    generation: u64,
    result: Option<PreloadedTrack>,
    shutdown: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 预加载器，持有一个后台工作线程
pub struct Preloader {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Default for Preloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Preloader {
    pub fn new() -> Self {
        Self::with_decoder(SymphoniaTrackDecoder)
    }

    pub fn with_decoder<D: TrackDecoder>(decoder: D) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::default()),
            wake: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("lumen-preload".into())
            .spawn(move || run_worker(worker_shared, decoder));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                // 没有工作线程时 start 只会停在 Loading，切歌自动退回同步加载
                log::error!("failed to spawn preload worker: {}", e);
                None
            }
        };

        Self { shared, worker }
    }

    /// 请求预加载，立即返回
    ///
    /// 进行中的请求被取消，未取用的结果被丢弃。
    pub fn start(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let stale = {
            let mut slot = self.shared.lock();
            slot.generation += 1;
            slot.request = Some(path.clone());
            slot.pending = true;
            slot.state = PreloadState::Loading;
            slot.result.take()
        };
        self.shared.wake.notify_one();

        if let Some(stale) = stale {
            log::debug!("preload: dropping unconsumed {:?}", stale.path);
        }
        log::debug!("preload: requested {:?}", path);
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lock().state == PreloadState::Ready
    }

    pub fn state(&self) -> PreloadState {
        self.shared.lock().state
    }

    /// 最近一次请求的路径
    pub fn requested(&self) -> Option<PathBuf> {
        self.shared.lock().request.clone()
    }

    /// 取走结果，仅当路径与 `expected` 完全一致时成功
    ///
    /// 不一致时不改变任何状态，调用方应退回同步加载。
    pub fn consume(&self, expected: &Path) -> Option<PreloadedTrack> {
        let mut slot = self.shared.lock();
        if slot.state != PreloadState::Ready {
            return None;
        }

        let matches = slot
            .result
            .as_ref()
            .is_some_and(|track| track.path == expected);
        if !matches {
            log::warn!(
                "preload: ready track {:?} does not match requested {:?}",
                slot.result.as_ref().map(|t| &t.path),
                expected
            );
            return None;
        }

        slot.state = PreloadState::Idle;
        slot.request = None;
        slot.result.take()
    }

    /// 取消：进行中的结果由工作线程丢弃，已就绪的结果立即释放。不等待工作线程。
    pub fn cancel(&self) {
        let stale = {
            let mut slot = self.shared.lock();
            slot.pending = false;
            slot.request = None;
            slot.state = match slot.state {
                // 只有解码还在进行时才需要等工作线程收尾
                PreloadState::Loading if slot.in_flight => PreloadState::Cancelled,
                PreloadState::Cancelled => PreloadState::Cancelled,
                _ => PreloadState::Idle,
            };
            slot.result.take()
        };
        drop(stale);
    }
}

impl Drop for Preloader {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<D: TrackDecoder>(shared: Arc<Shared>, decoder: D) {
    loop {
        let (path, generation) = {
            let mut slot = shared.lock();
            while !slot.pending && !slot.shutdown {
                slot = shared.wake.wait(slot).unwrap_or_else(PoisonError::into_inner);
            }
            if slot.shutdown {
                return;
            }
            slot.pending = false;
            slot.in_flight = slot.request.is_some();
            match slot.request.clone() {
                Some(path) => (path, slot.generation),
                None => continue,
            }
        };

        let outcome = decoder.decode(&path);

        let discarded = {
            let mut slot = shared.lock();
            if slot.shutdown {
                return;
            }

            slot.in_flight = false;
            let live = slot.generation == generation && slot.state == PreloadState::Loading;
            // cancel 之后没有新请求，无论结果属于哪一代
            if slot.state == PreloadState::Cancelled {
                slot.state = PreloadState::Idle;
            }

            match outcome {
                Ok(track) if live => {
                    log::debug!("preload: ready {:?}", track.path);
                    slot.result = Some(track);
                    slot.state = PreloadState::Ready;
                    None
                }
                Ok(track) => Some(track),
                Err(e) => {
                    // 解码失败只是没有结果，切歌时走同步加载
                    if live {
                        log::warn!("preload: failed to decode {:?}: {}", path, e);
                        slot.state = PreloadState::Idle;
                    }
                    None
                }
            }
        };

        if let Some(track) = discarded {
            log::debug!("preload: discarded superseded {:?}", track.path);
        }
    }
}
