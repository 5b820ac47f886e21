//! 字节环形缓冲区
//!
//! 单写单读，一把互斥锁。写满后多出来的字节直接丢弃，不阻塞也不扩容；
//! 锁只在 memcpy 期间持有，从不跨越 I/O。

use std::sync::{Mutex, MutexGuard, PoisonError};

struct RingState {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    available: usize,
}

/// 固定容量的字节环形缓冲区
pub struct RingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                data: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                available: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前可读字节数
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// 剩余可写空间
    pub fn free(&self) -> usize {
        self.capacity - self.available()
    }

    /// 写入数据，返回实际写入的字节数；空间不足时丢弃尾部
    pub fn write(&self, input: &[u8]) -> usize {
        let mut st = self.lock();
        let to_write = input.len().min(self.capacity - st.available);
        if to_write == 0 {
            return 0;
        }

        let write_pos = st.write_pos;
        let first = to_write.min(self.capacity - write_pos);
        st.data[write_pos..write_pos + first].copy_from_slice(&input[..first]);
        let second = to_write - first;
        if second > 0 {
            st.data[..second].copy_from_slice(&input[first..to_write]);
        }

        st.write_pos = (write_pos + to_write) % self.capacity;
        st.available += to_write;
        to_write
    }

    /// 读取数据，返回实际读取的字节数（不超过 available）
    pub fn read(&self, output: &mut [u8]) -> usize {
        self.read_aligned(output, 1)
    }

    /// 读取不超过 `output.len()` 字节，且长度是 `align` 的整数倍
    pub fn read_aligned(&self, output: &mut [u8], align: usize) -> usize {
        let align = align.max(1);
        let mut st = self.lock();
        let mut to_read = output.len().min(st.available);
        to_read -= to_read % align;
        if to_read == 0 {
            return 0;
        }

        let read_pos = st.read_pos;
        let first = to_read.min(self.capacity - read_pos);
        output[..first].copy_from_slice(&st.data[read_pos..read_pos + first]);
        let second = to_read - first;
        if second > 0 {
            output[first..to_read].copy_from_slice(&st.data[..second]);
        }

        st.read_pos = (read_pos + to_read) % self.capacity;
        st.available -= to_read;
        to_read
    }

    /// 清空：游标归零，available = 0
    pub fn reset(&self) {
        let mut st = self.lock();
        st.read_pos = 0;
        st.write_pos = 0;
        st.available = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_wraparound() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.write(&[1, 2, 3, 4, 5, 6]), 6);

        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        // 跨越末尾写入
        assert_eq!(ring.write(&[7, 8, 9, 10, 11]), 5);
        assert_eq!(ring.available(), 7);

        let mut out = [0u8; 7];
        assert_eq!(ring.read(&mut out), 7);
        assert_eq!(out, [5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_overflow_drops_excess() {
        let ring = RingBuffer::new(4);
        assert_eq!(ring.write(&[1, 2, 3]), 3);
        assert_eq!(ring.write(&[4, 5, 6]), 1);
        assert_eq!(ring.available(), 4);
        assert_eq!(ring.write(&[7]), 0);

        let mut out = [0u8; 4];
        ring.read(&mut out);
        // 保留的是旧数据，新数据被丢弃
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_over_read_is_truncated() {
        let ring = RingBuffer::new(16);
        ring.write(&[9; 5]);
        let mut out = [0u8; 12];
        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn test_available_tracks_writes_minus_reads() {
        let ring = RingBuffer::new(64);
        let mut written = 0usize;
        let mut read = 0usize;
        let mut scratch = [0u8; 32];

        // 固定的伪随机写读序列
        let mut seed = 0x2545_F491u32;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let n = (seed % 30) as usize;
            if seed & 1 == 0 {
                written += ring.write(&scratch[..n]);
            } else {
                read += ring.read(&mut scratch[..n]);
            }
            assert!(ring.available() <= ring.capacity());
            assert_eq!(ring.available(), written - read);
        }
    }

    #[test]
    fn test_read_aligned() {
        let ring = RingBuffer::new(16);
        ring.write(&[0; 7]);
        let mut out = [0u8; 16];
        assert_eq!(ring.read_aligned(&mut out, 4), 4);
        assert_eq!(ring.available(), 3);
        assert_eq!(ring.read_aligned(&mut out, 4), 0);
    }

    #[test]
    fn test_reset() {
        let ring = RingBuffer::new(8);
        ring.write(&[1, 2, 3]);
        ring.reset();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.free(), 8);
        ring.write(&[4]);
        let mut out = [0u8; 1];
        ring.read(&mut out);
        assert_eq!(out, [4]);
    }
}
