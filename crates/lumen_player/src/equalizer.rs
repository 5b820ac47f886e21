//! 5 段参数均衡器
//!
//! 60 Hz 低架、250 Hz / 1 kHz / 4 kHz 峰值 (Q = 1)、16 kHz 高架，±12 dB，步进 2 dB。
//! 系数按 Audio EQ Cookbook 计算。
//!
//! 控制端 [`Equalizer`] 在主线程修改增益，把不可变的系数快照通过 `ArcSwap` 原子替换；
//! 音频线程的 [`EqProcessor`] 只读快照并持有自己的滤波历史，回调里不加锁、不分配。

use std::f64::consts::PI;
use std::sync::Arc;

use arc_swap::ArcSwap;

pub const BAND_COUNT: usize = 5;
pub const MIN_DB: i32 = -12;
pub const MAX_DB: i32 = 12;
pub const STEP_DB: i32 = 2;

/// 系数设计使用的采样率
pub const EQ_SAMPLE_RATE: u32 = 44100;

/// 软削波起始电平（满幅的 94%）
const SOFT_CLIP_THRESHOLD: f64 = 0.94;
const PEAKING_Q: f64 = 1.0;
/// 架式滤波器使用 S = 1 的斜率，等价于 Q = 1/√2
const SHELF_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// 频段形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandShape {
    LowShelf,
    Peaking,
    HighShelf,
}

/// 频段定义
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandSpec {
    pub freq_hz: f64,
    pub shape: BandShape,
    pub label: &'static str,
}

pub const BANDS: [BandSpec; BAND_COUNT] = [
    BandSpec { freq_hz: 60.0, shape: BandShape::LowShelf, label: "60" },
    BandSpec { freq_hz: 250.0, shape: BandShape::Peaking, label: "250" },
    BandSpec { freq_hz: 1000.0, shape: BandShape::Peaking, label: "1k" },
    BandSpec { freq_hz: 4000.0, shape: BandShape::Peaking, label: "4k" },
    BandSpec { freq_hz: 16000.0, shape: BandShape::HighShelf, label: "16k" },
];

/// Biquad 系数（已按 a0 归一化）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// 恒等滤波器
    pub const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    /// 按形状计算系数；0 dB 直接返回恒等系数
    pub fn design(shape: BandShape, freq: f64, gain_db: f64, sample_rate: f64) -> Self {
        if gain_db == 0.0 {
            return Self::IDENTITY;
        }
        match shape {
            BandShape::LowShelf => Self::low_shelf(freq, SHELF_Q, gain_db, sample_rate),
            BandShape::Peaking => Self::peaking(freq, PEAKING_Q, gain_db, sample_rate),
            BandShape::HighShelf => Self::high_shelf(freq, SHELF_Q, gain_db, sample_rate),
        }
    }

    pub fn peaking(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha / a;

        Self::normalized(b0, b1, b2, a0, a1, a2)
    }

    pub fn low_shelf(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let b0 = a * ((a + 1.0) - (a - 1.0) * cos_omega + two_sqrt_a_alpha);
        let b1 = 2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega);
        let b2 = a * ((a + 1.0) - (a - 1.0) * cos_omega - two_sqrt_a_alpha);
        let a0 = (a + 1.0) + (a - 1.0) * cos_omega + two_sqrt_a_alpha;
        let a1 = -2.0 * ((a - 1.0) + (a + 1.0) * cos_omega);
        let a2 = (a + 1.0) + (a - 1.0) * cos_omega - two_sqrt_a_alpha;

        Self::normalized(b0, b1, b2, a0, a1, a2)
    }

    pub fn high_shelf(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let b0 = a * ((a + 1.0) + (a - 1.0) * cos_omega + two_sqrt_a_alpha);
        let b1 = -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega);
        let b2 = a * ((a + 1.0) + (a - 1.0) * cos_omega - two_sqrt_a_alpha);
        let a0 = (a + 1.0) - (a - 1.0) * cos_omega + two_sqrt_a_alpha;
        let a1 = 2.0 * ((a - 1.0) - (a + 1.0) * cos_omega);
        let a2 = (a + 1.0) - (a - 1.0) * cos_omega - two_sqrt_a_alpha;

        Self::normalized(b0, b1, b2, a0, a1, a2)
    }

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// 单声道 Direct Form I 历史
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl BiquadState {
    #[inline]
    fn process(&mut self, c: &BiquadCoeffs, x: f64) -> f64 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// 单个频段的不可变参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandSnapshot {
    pub gain_db: i32,
    pub coeffs: BiquadCoeffs,
    /// 每次增益变化递增，处理端据此清空历史
    pub generation: u64,
}

/// 整个均衡器的系数快照
#[derive(Debug, Clone, PartialEq)]
pub struct EqSnapshot {
    pub bands: [BandSnapshot; BAND_COUNT],
    pub flat: bool,
}

impl EqSnapshot {
    fn flat() -> Self {
        Self {
            bands: [BandSnapshot {
                gain_db: 0,
                coeffs: BiquadCoeffs::IDENTITY,
                generation: 0,
            }; BAND_COUNT],
            flat: true,
        }
    }
}

/// 均衡器控制端（主线程）
pub struct Equalizer {
    current: EqSnapshot,
    shared: Arc<ArcSwap<EqSnapshot>>,
    sample_rate: f64,
}

impl Default for Equalizer {
    fn default() -> Self {
        Self::new(EQ_SAMPLE_RATE)
    }
}

impl Equalizer {
    pub fn new(sample_rate: u32) -> Self {
        let current = EqSnapshot::flat();
        Self {
            shared: Arc::new(ArcSwap::from_pointee(current.clone())),
            current,
            sample_rate: sample_rate as f64,
        }
    }

    /// 创建音频线程使用的处理器
    pub fn processor(&self) -> EqProcessor {
        EqProcessor {
            shared: self.shared.clone(),
            history: [[BiquadState::default(); 2]; BAND_COUNT],
            seen: self.current.bands.map(|b| b.generation),
        }
    }

    /// 设置频段增益，返回实际生效的值
    ///
    /// 超出范围的值被钳制到 ±12 dB，并向零取整到 2 dB 步进。频段号越界时忽略。
    pub fn set_band_db(&mut self, band: usize, db: i32) -> i32 {
        let Some(spec) = BANDS.get(band) else {
            log::warn!("equalizer band {} out of range", band);
            return 0;
        };

        let db = snap_db(db);
        let slot = &mut self.current.bands[band];
        if slot.gain_db == db {
            return db;
        }

        slot.gain_db = db;
        slot.coeffs = BiquadCoeffs::design(spec.shape, spec.freq_hz, db as f64, self.sample_rate);
        slot.generation += 1;
        self.current.flat = self.current.bands.iter().all(|b| b.gain_db == 0);

        log::debug!("equalizer band {} ({} Hz) -> {} dB", band, spec.label, db);
        self.publish();
        db
    }

    /// 按方向调整一个步进（direction > 0 增加，< 0 减少）
    pub fn adjust_band(&mut self, band: usize, direction: i32) -> i32 {
        let current = self.band_db(band).unwrap_or(0);
        let step = STEP_DB * direction.signum();
        self.set_band_db(band, current + step)
    }

    /// 所有频段归零
    pub fn reset(&mut self) {
        for band in 0..BAND_COUNT {
            self.set_band_db(band, 0);
        }
    }

    pub fn band_db(&self, band: usize) -> Option<i32> {
        self.current.bands.get(band).map(|b| b.gain_db)
    }

    pub fn gains(&self) -> [i32; BAND_COUNT] {
        self.current.bands.map(|b| b.gain_db)
    }

    /// 批量应用（例如启动时恢复保存的设置）
    pub fn apply_gains(&mut self, gains: &[i32]) {
        for (band, db) in gains.iter().enumerate().take(BAND_COUNT) {
            self.set_band_db(band, *db);
        }
    }

    pub fn is_flat(&self) -> bool {
        self.current.flat
    }

    pub fn coeffs(&self, band: usize) -> Option<BiquadCoeffs> {
        self.current.bands.get(band).map(|b| b.coeffs)
    }

    fn publish(&self) {
        self.shared.store(Arc::new(self.current.clone()));
    }
}

fn snap_db(db: i32) -> i32 {
    let db = db.clamp(MIN_DB, MAX_DB);
    db - db % STEP_DB
}

/// 音频线程侧：持有滤波历史，原地处理交错立体声
pub struct EqProcessor {
    shared: Arc<ArcSwap<EqSnapshot>>,
    history: [[BiquadState; 2]; BAND_COUNT],
    seen: [u64; BAND_COUNT],
}

impl EqProcessor {
    /// 混音后钩子：原地处理 16-bit 交错立体声
    pub fn process(&mut self, samples: &mut [i16]) {
        let snapshot = self.shared.load();

        // 增益变过的频段清空历史，避免爆音
        for (band, params) in snapshot.bands.iter().enumerate() {
            if params.generation != self.seen[band] {
                self.history[band] = [BiquadState::default(); 2];
                self.seen[band] = params.generation;
            }
        }

        if snapshot.flat {
            return;
        }

        for frame in samples.chunks_exact_mut(2) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let mut x = *sample as f64 / 32768.0;
                for (band, params) in snapshot.bands.iter().enumerate() {
                    if params.gain_db == 0 {
                        continue;
                    }
                    x = self.history[band][ch].process(&params.coeffs, x);
                }
                *sample = to_i16(soft_clip(x));
            }
        }
    }
}

/// tanh 软削波：阈值以下原样通过
#[inline]
pub fn soft_clip(x: f64) -> f64 {
    let magnitude = x.abs();
    if magnitude <= SOFT_CLIP_THRESHOLD {
        return x;
    }
    let headroom = 1.0 - SOFT_CLIP_THRESHOLD;
    let over = (magnitude - SOFT_CLIP_THRESHOLD) / headroom;
    x.signum() * (SOFT_CLIP_THRESHOLD + headroom * over.tanh())
}

#[inline]
fn to_i16(x: f64) -> i16 {
    (x * 32768.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}
