//! 管道 PCM 流读取
//!
//! 外部进程以自己的节奏往命名管道写入 16-bit 立体声 PCM。后台线程把数据读进
//! 环形缓冲，消费方按需取出带 WAV 头的数据块交给混音器。
//!
//! 缓冲满时直接丢弃新数据（按整帧丢弃），上游自行限速。

use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use lumen_format::WavHeader;

use crate::{RingBuffer, StreamSettings, BYTES_PER_FRAME, OUTPUT_CHANNELS};

/// 读取端等待数据的轮询间隔，决定 stop() 的响应速度
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 流读取错误
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Stream reader already running")]
    AlreadyRunning,
    #[error("Stream has ended, reset before restarting")]
    Ended,
    #[error("Failed to spawn stream worker: {0}")]
    Spawn(#[source] io::Error),
}

/// PCM 数据来源
///
/// `open` 在工作线程里调用。返回的读取器应当周期性地以 `TimedOut` /
/// `WouldBlock` 返回，让工作线程有机会检查停止标志；读到 0 字节表示结束。
pub trait PcmSource: Send + Sync + 'static {
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    fn describe(&self) -> String;
}

/// 命名管道
#[cfg(unix)]
pub struct FifoSource {
    path: std::path::PathBuf,
    poll_interval: Duration,
}

#[cfg(unix)]
impl FifoSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(unix)]
impl PcmSource for FifoSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        // 非阻塞打开：写端还没连上时不会卡住
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)?;

        // 之后切回阻塞读，由 poll 控制等待
        let fd = file.as_raw_fd();
        // SAFETY: fd 由 file 持有，在这两次调用期间有效
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: 同上
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let timeout_ms = self.poll_interval.as_millis().min(i32::MAX as u128) as i32;
        Ok(Box::new(PolledFile { file, timeout_ms }))
    }

    fn describe(&self) -> String {
        format!("fifo {}", self.path.display())
    }
}

/// 每次读取前先 poll，超时返回 `TimedOut`
#[cfg(unix)]
struct PolledFile {
    file: std::fs::File,
    timeout_ms: i32,
}

#[cfg(unix)]
impl Read for PolledFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::io::AsRawFd;

        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd 是栈上的单个有效 pollfd
        let rc = unsafe { libc::poll(&mut pfd, 1, self.timeout_ms) };
        match rc {
            0 => Err(ErrorKind::TimedOut.into()),
            rc if rc < 0 => Err(io::Error::last_os_error()),
            // POLLIN 或 POLLHUP：read 返回数据或 0 (EOF)
            _ => self.file.read(buf),
        }
    }
}

/// 进程内通道，发送端全部关闭即 EOF
#[derive(Clone)]
pub struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    poll_interval: Duration,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl PcmSource for ChannelSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(ChannelReader {
            rx: self.rx.clone(),
            pending: Vec::new(),
            pos: 0,
            poll_interval: self.poll_interval,
        }))
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    poll_interval: Duration,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(data) => {
                    self.pending = data;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => return Err(ErrorKind::TimedOut.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct StreamShared {
    ring: RingBuffer,
    stop: AtomicBool,
    eof: AtomicBool,
    /// 最近一次收到数据的时间（相对 epoch 的毫秒数 + 1），0 表示从未收到
    last_data: AtomicU64,
    epoch: Instant,
}

impl StreamShared {
    fn stamp(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64 + 1;
        self.last_data.store(ms, Ordering::Release);
    }

    fn since_last_data(&self) -> Option<Duration> {
        match self.last_data.load(Ordering::Acquire) {
            0 => None,
            ms => Some(
                self.epoch
                    .elapsed()
                    .saturating_sub(Duration::from_millis(ms - 1)),
            ),
        }
    }
}

/// 环形缓冲的管道流读取器
pub struct StreamingReader {
    source: Arc<dyn PcmSource>,
    shared: Arc<StreamShared>,
    worker: Option<JoinHandle<()>>,
    sample_rate: u32,
    read_chunk_bytes: usize,
    prebuffer_bytes: usize,
    stall_window: Duration,
}

impl StreamingReader {
    /// 分配环形缓冲：每秒字节数 × buffer_secs
    pub fn new(source: Arc<dyn PcmSource>, settings: &StreamSettings, sample_rate: u32) -> Self {
        let capacity = StreamSettings::secs_to_bytes(settings.buffer_secs, sample_rate)
            .max(BYTES_PER_FRAME);
        let prebuffer_bytes =
            StreamSettings::secs_to_bytes(settings.prebuffer_secs, sample_rate).min(capacity);

        Self {
            source,
            shared: Arc::new(StreamShared {
                ring: RingBuffer::new(capacity),
                stop: AtomicBool::new(false),
                eof: AtomicBool::new(false),
                last_data: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
            worker: None,
            sample_rate,
            read_chunk_bytes: settings.read_chunk_bytes.max(BYTES_PER_FRAME),
            prebuffer_bytes,
            stall_window: Duration::from_secs_f64(settings.stall_timeout_secs.max(0.0)),
        }
    }

    /// 启动工作线程
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.worker.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        if self.is_eof() {
            return Err(StreamError::Ended);
        }

        self.shared.stop.store(false, Ordering::Release);
        let shared = self.shared.clone();
        let source = self.source.clone();
        let chunk = self.read_chunk_bytes;

        let handle = thread::Builder::new()
            .name("lumen-stream".into())
            .spawn(move || run_worker(shared, source, chunk))
            .map_err(StreamError::Spawn)?;
        self.worker = Some(handle);
        Ok(())
    }

    /// 停止并等待工作线程退出，已缓冲的数据保留
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// 停止、清空缓冲和 EOF 标记，之后可以再次 start
    pub fn reset(&mut self) {
        self.stop();
        self.shared.ring.reset();
        self.shared.eof.store(false, Ordering::Release);
        self.shared.last_data.store(0, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// 缓冲量达到预缓冲阈值，随当前缓冲量变化
    pub fn is_ready(&self) -> bool {
        self.buffered() >= self.prebuffer_bytes.max(1)
    }

    /// 停滞窗口内收到过数据
    pub fn is_receiving(&self) -> bool {
        self.shared
            .since_last_data()
            .is_some_and(|elapsed| elapsed < self.stall_window)
    }

    /// 流已结束，直到 reset 前一直为真
    pub fn is_eof(&self) -> bool {
        self.shared.eof.load(Ordering::Acquire)
    }

    /// 已缓冲字节数
    pub fn buffered(&self) -> usize {
        self.shared.ring.available()
    }

    /// 已缓冲的秒数
    pub fn buffered_secs(&self) -> f64 {
        self.buffered() as f64 / StreamSettings::bytes_per_sec(self.sample_rate) as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// 取出最多 `max_secs` 秒的数据（整帧，至少一帧），包装成内存 WAV；缓冲为空时返回 None
    pub fn get_chunk(&self, max_secs: f64) -> Option<Vec<u8>> {
        let want = StreamSettings::secs_to_bytes(max_secs, self.sample_rate)
            .max(BYTES_PER_FRAME)
            .min(self.buffered());
        if want < BYTES_PER_FRAME {
            return None;
        }

        let mut pcm = vec![0u8; want];
        let n = self.shared.ring.read_aligned(&mut pcm, BYTES_PER_FRAME);
        if n == 0 {
            return None;
        }
        pcm.truncate(n);

        let header = WavHeader::pcm16(self.sample_rate, OUTPUT_CHANNELS, n as u32);
        let mut wav = Vec::with_capacity(lumen_format::WAV_HEADER_LEN + n);
        wav.extend_from_slice(&header.to_bytes());
        wav.extend_from_slice(&pcm);
        Some(wav)
    }
}

impl Drop for StreamingReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: Arc<StreamShared>, source: Arc<dyn PcmSource>, chunk_bytes: usize) {
    let name = source.describe();
    let mut reader = match source.open() {
        Ok(reader) => reader,
        Err(e) => {
            log::warn!("stream: failed to open {}: {}", name, e);
            shared.eof.store(true, Ordering::Release);
            return;
        }
    };
    log::info!("stream: reading from {}", name);

    // 多留一帧给上次剩下的半帧
    let mut buf = vec![0u8; chunk_bytes + BYTES_PER_FRAME];
    let mut carry = 0usize;
    let mut dropped = 0usize;

    while !shared.stop.load(Ordering::Acquire) {
        match reader.read(&mut buf[carry..carry + chunk_bytes]) {
            Ok(0) => {
                log::info!("stream: end of stream from {}", name);
                shared.eof.store(true, Ordering::Release);
                break;
            }
            Ok(n) => {
                shared.stamp();
                let total = carry + n;
                let whole = total - total % BYTES_PER_FRAME;

                // 单写者，free() 在这里只会变大
                let free = shared.ring.free();
                let room = free - free % BYTES_PER_FRAME;
                let kept = shared.ring.write(&buf[..whole.min(room)]);
                dropped += whole - kept;

                buf.copy_within(whole..total, 0);
                carry = total - whole;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(e) => {
                log::warn!("stream: read error on {}: {}", name, e);
                shared.eof.store(true, Ordering::Release);
                break;
            }
        }
    }

    if dropped > 0 {
        log::debug!("stream: dropped {} bytes on full buffer", dropped);
    }
}
