//! 播放状态和曲目信息

use std::path::PathBuf;
use std::time::Duration;

/// 播放状态
///
/// `Stopped -> Loaded -> Playing <-> Paused -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Loaded,
    Playing,
    Paused,
}

/// 曲目信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    pub path: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// 总时长，未知时为 0
    pub duration: Duration,
    pub position: Duration,
}

impl TrackInfo {
    /// 剩余时长，总时长未知时为 None
    pub fn remaining(&self) -> Option<Duration> {
        if self.duration.is_zero() {
            None
        } else {
            Some(self.duration.saturating_sub(self.position))
        }
    }
}
