//! 混音器
//!
//! 一个音乐槽位加一个等待队列。输出回调调用 [`Mixer::mix`]：只用 `try_lock`，
//! 控制线程占用时本周期输出静音，绝不阻塞。播完的音源交回控制线程释放。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::{Source, SourceError};

/// 混音器原生音量上限
pub const MAX_VOLUME: u8 = 128;

/// 混音后钩子：在音量处理之后、输出之前原地修改交错立体声
pub type PostMixHook = Box<dyn FnMut(&mut [i16]) + Send>;

const RETIRED_CAPACITY: usize = 16;

struct MusicSlot {
    current: Option<Box<dyn Source>>,
    queue: VecDeque<Box<dyn Source>>,
    /// 回收通道满时暂存，由 reap 释放
    spill: Vec<Box<dyn Source>>,
}

impl MusicSlot {
    fn new() -> Self {
        Self {
            current: None,
            queue: VecDeque::new(),
            spill: Vec::with_capacity(RETIRED_CAPACITY),
        }
    }
}

pub struct Mixer {
    music: Mutex<MusicSlot>,
    post_mix: Mutex<Option<PostMixHook>>,
    volume: AtomicU8,
    paused: AtomicBool,
    /// 当前音源与队列都已播完
    drained: AtomicBool,
    frames_mixed: AtomicU64,
    retired_tx: Sender<Box<dyn Source>>,
    retired_rx: Receiver<Box<dyn Source>>,
    sample_rate: u32,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        let (retired_tx, retired_rx) = bounded(RETIRED_CAPACITY);
        Self {
            music: Mutex::new(MusicSlot::new()),
            post_mix: Mutex::new(None),
            volume: AtomicU8::new(MAX_VOLUME),
            paused: AtomicBool::new(true),
            drained: AtomicBool::new(true),
            frames_mixed: AtomicU64::new(0),
            retired_tx,
            retired_rx,
            sample_rate,
        }
    }

    fn lock_music(&self) -> MutexGuard<'_, MusicSlot> {
        self.music.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// 装入音乐（暂停状态），替换当前音源并清空队列
    pub fn load_music(&self, source: Box<dyn Source>) {
        let (old, queue) = {
            let mut music = self.lock_music();
            let old = music.current.replace(source);
            (old, std::mem::take(&mut music.queue))
        };
        self.paused.store(true, Ordering::Release);
        self.drained.store(false, Ordering::Release);
        // 锁外释放旧音源
        drop(old);
        drop(queue);
    }

    /// 追加到队列末尾，当前音源播完后无缝接上
    pub fn queue_music(&self, source: Box<dyn Source>) {
        let mut music = self.lock_music();
        if music.current.is_none() {
            music.current = Some(source);
        } else {
            music.queue.push_back(source);
        }
        self.drained.store(false, Ordering::Release);
    }

    /// 已排队（不含当前）的音源数量
    pub fn queued(&self) -> usize {
        self.lock_music().queue.len()
    }

    pub fn has_music(&self) -> bool {
        self.lock_music().current.is_some()
    }

    /// 停止并丢弃所有音源
    pub fn halt(&self) {
        let (current, queue, spilled) = {
            let mut music = self.lock_music();
            let spilled: Vec<_> = music.spill.drain(..).collect();
            (music.current.take(), std::mem::take(&mut music.queue), spilled)
        };
        self.paused.store(true, Ordering::Release);
        self.drained.store(true, Ordering::Release);
        drop(current);
        drop(queue);
        drop(spilled);
        self.reap();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// 当前音源和队列都已播完
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// 当前音源跳转
    pub fn seek(&self, secs: f64) -> Result<(), SourceError> {
        let mut music = self.lock_music();
        let source = music.current.as_mut().ok_or(SourceError::NoSource)?;
        source.seek(secs)?;
        self.drained.store(false, Ordering::Release);
        Ok(())
    }

    /// 设置原生音量 (0 - MAX_VOLUME)
    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(MAX_VOLUME), Ordering::Relaxed);
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    /// 注册（或用 None 移除）混音后钩子
    pub fn set_post_mix(&self, hook: Option<PostMixHook>) {
        let old = {
            let mut slot = self.post_mix.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, hook)
        };
        drop(old);
    }

    /// 累计混出的帧数
    pub fn frames_mixed(&self) -> u64 {
        self.frames_mixed.load(Ordering::Relaxed)
    }

    /// 释放回调线程交回的音源，在控制线程定期调用
    pub fn reap(&self) -> usize {
        let spilled: Vec<_> = self.lock_music().spill.drain(..).collect();
        spilled.len() + self.retired_rx.try_iter().count()
    }

    fn retire(&self, music: &mut MusicSlot, source: Box<dyn Source>) {
        // 通道满时留在槽位里，不在回调线程释放
        if let Err(e) = self.retired_tx.try_send(source) {
            music.spill.push(e.into_inner());
        }
    }

    /// 输出回调：填充交错立体声
    pub fn mix(&self, out: &mut [i16]) {
        out.fill(0);

        if !self.paused.load(Ordering::Acquire) {
            let guard = match self.music.try_lock() {
                Ok(guard) => Some(guard),
                Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            };

            if let Some(mut music) = guard {
                let written = self.fill_from(&mut music, out);
                self.frames_mixed
                    .fetch_add((written / 2) as u64, Ordering::Relaxed);
                if music.current.is_none() {
                    self.drained.store(true, Ordering::Release);
                }
                drop(music);

                let volume = self.volume.load(Ordering::Relaxed) as i32;
                if volume < MAX_VOLUME as i32 {
                    for sample in &mut out[..written] {
                        *sample = ((*sample as i32 * volume) / MAX_VOLUME as i32) as i16;
                    }
                }
            }
        }

        let hook = match self.post_mix.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut hook) = hook {
            if let Some(hook) = hook.as_mut() {
                hook(out);
            }
        }
    }

    fn fill_from(&self, music: &mut MusicSlot, out: &mut [i16]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let Some(source) = music.current.as_mut() else {
                break;
            };
            written += source.read(&mut out[written..]);
            if written < out.len() {
                // 短读即结束，切换到队列中的下一个
                if let Some(done) = music.current.take() {
                    self.retire(music, done);
                }
                music.current = music.queue.pop_front();
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySource;
    use lumen_format::wav_from_samples;
    use std::sync::Arc;

    fn memory(samples: &[i16]) -> Box<dyn Source> {
        Box::new(MemorySource::from_wav(wav_from_samples(samples, 44100, 2)).unwrap())
    }

    #[test]
    fn test_paused_outputs_silence() {
        let mixer = Mixer::new(44100);
        mixer.load_music(memory(&[100; 64]));
        let mut out = [7i16; 16];
        mixer.mix(&mut out);
        assert_eq!(out, [0; 16]);
        assert!(!mixer.is_drained());
    }

    #[test]
    fn test_queue_is_gapless() {
        let mixer = Mixer::new(44100);
        mixer.load_music(memory(&[1, 1, 2, 2]));
        mixer.queue_music(memory(&[3, 3, 4, 4, 5, 5]));
        mixer.resume();

        let mut out = [0i16; 8];
        mixer.mix(&mut out);
        assert_eq!(out, [1, 1, 2, 2, 3, 3, 4, 4]);
        assert!(!mixer.is_drained());

        mixer.mix(&mut out);
        assert_eq!(out, [5, 5, 0, 0, 0, 0, 0, 0]);
        assert!(mixer.is_drained());
        assert_eq!(mixer.frames_mixed(), 5);
        assert_eq!(mixer.reap(), 2);
    }

    #[test]
    fn test_volume_scaling() {
        let mixer = Mixer::new(44100);
        mixer.load_music(memory(&[1000, -1000, 1000, -1000]));
        mixer.set_volume(64);
        mixer.resume();

        let mut out = [0i16; 4];
        mixer.mix(&mut out);
        assert_eq!(out, [500, -500, 500, -500]);

        mixer.set_volume(255);
        assert_eq!(mixer.volume(), MAX_VOLUME);
    }

    #[test]
    fn test_post_mix_sees_every_buffer() {
        let mixer = Mixer::new(44100);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        mixer.set_post_mix(Some(Box::new(move |buf: &mut [i16]| {
            counter.fetch_add(1, Ordering::Relaxed);
            buf[0] = 42;
        })));

        // 暂停时也经过钩子
        let mut out = [0i16; 4];
        mixer.mix(&mut out);
        assert_eq!(out[0], 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        mixer.set_post_mix(None);
        mixer.mix(&mut out);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_contended_lock_yields_silence() {
        let mixer = Mixer::new(44100);
        mixer.load_music(memory(&[9; 32]));
        mixer.resume();

        let held = mixer.lock_music();
        let mut out = [1i16; 8];
        mixer.mix(&mut out);
        assert_eq!(out, [0; 8]);
        drop(held);

        mixer.mix(&mut out);
        assert_eq!(out, [9; 8]);
    }

    /// 析构时计数
    struct Counted {
        inner: MemorySource,
        drops: Arc<AtomicU64>,
    }

    impl Source for Counted {
        fn read(&mut self, out: &mut [i16]) -> usize {
            self.inner.read(out)
        }

        fn seek(&mut self, secs: f64) -> Result<(), SourceError> {
            self.inner.seek(secs)
        }

        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }

        fn duration_secs(&self) -> Option<f64> {
            self.inner.duration_secs()
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_retired_overflow_is_freed_by_reap() {
        let drops = Arc::new(AtomicU64::new(0));
        let counted = || -> Box<dyn Source> {
            Box::new(Counted {
                inner: MemorySource::from_wav(wav_from_samples(&[1, 1], 44100, 2)).unwrap(),
                drops: drops.clone(),
            })
        };

        let mixer = Mixer::new(44100);
        mixer.load_music(counted());
        for _ in 0..20 {
            mixer.queue_music(counted());
        }
        mixer.resume();

        // 21 个音源超过回收通道容量，回调里一个都不释放
        let mut out = [0i16; 64];
        mixer.mix(&mut out);
        assert!(mixer.is_drained());
        assert_eq!(mixer.frames_mixed(), 21);
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        assert_eq!(mixer.reap(), 21);
        assert_eq!(drops.load(Ordering::Relaxed), 21);
        assert_eq!(mixer.reap(), 0);
    }

    #[test]
    fn test_halt_and_seek() {
        let mixer = Mixer::new(44100);
        assert!(matches!(mixer.seek(1.0), Err(SourceError::NoSource)));

        mixer.load_music(memory(&[5; 400]));
        mixer.seek(0.0).unwrap();
        assert!(mixer.has_music());

        mixer.halt();
        assert!(!mixer.has_music());
        assert!(mixer.is_drained());
        assert!(mixer.is_paused());
    }
}
