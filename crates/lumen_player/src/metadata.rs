//! 曲目标签
//!
//! 先读文件内标签，缺失时由文件名推导显示信息。

use std::path::Path;

use symphonia::core::meta::{MetadataRevision, StandardTagKey};
use symphonia::core::probe::ProbeResult;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";

/// 从文件读到的标签（都可能缺失）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl TrackTags {
    /// 从探测结果中收集标签（容器级与探测期两处都看）
    pub fn from_probe(probed: &mut ProbeResult) -> Self {
        let mut tags = Self::default();

        if let Some(rev) = probed.format.metadata().current() {
            tags.absorb(rev);
        }
        if let Some(meta) = probed.metadata.get() {
            if let Some(rev) = meta.current() {
                tags.absorb(rev);
            }
        }

        tags
    }

    fn absorb(&mut self, rev: &MetadataRevision) {
        for tag in rev.tags() {
            let slot = match tag.std_key {
                Some(StandardTagKey::TrackTitle) => &mut self.title,
                Some(StandardTagKey::Artist) => &mut self.artist,
                Some(StandardTagKey::Album) => &mut self.album,
                _ => continue,
            };
            let value = tag.value.to_string();
            let value = value.trim();
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value.to_string());
            }
        }
    }

    pub fn display_title(&self, path: &Path) -> String {
        self.title.clone().unwrap_or_else(|| title_from_path(path))
    }

    pub fn display_artist(&self) -> String {
        self.artist.clone().unwrap_or_else(|| UNKNOWN_ARTIST.to_string())
    }

    pub fn display_album(&self) -> String {
        self.album.clone().unwrap_or_else(|| UNKNOWN_ALBUM.to_string())
    }
}

/// 文件名去掉扩展名作为标题
pub fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_falls_back_to_filename() {
        let tags = TrackTags::default();
        let path = Path::new("/music/a.mp3");
        assert_eq!(tags.display_title(path), "a");
        assert_eq!(tags.display_artist(), UNKNOWN_ARTIST);
        assert_eq!(tags.display_album(), UNKNOWN_ALBUM);
    }

    #[test]
    fn test_tags_take_precedence() {
        let tags = TrackTags {
            title: Some("Real Title".into()),
            artist: Some("Someone".into()),
            album: None,
        };
        assert_eq!(tags.display_title(Path::new("x.flac")), "Real Title");
        assert_eq!(tags.display_artist(), "Someone");
        assert_eq!(tags.display_album(), UNKNOWN_ALBUM);
    }

    #[test]
    fn test_title_from_path() {
        assert_eq!(title_from_path(Path::new("dir/My Song.final.ogg")), "My Song.final");
        assert_eq!(title_from_path(Path::new("noext")), "noext");
    }
}
