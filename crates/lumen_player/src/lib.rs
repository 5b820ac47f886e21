//! lumen_player - 播放管线
//!
//! 无缝切歌的预加载、实时五段均衡器、管道 PCM 流读取，以及驱动混音器的播放引擎。

mod config;
mod context;
mod decoder;
mod engine;
mod equalizer;
mod metadata;
mod mixer;
mod output;
mod preloader;
mod ring_buffer;
mod source;
mod state;
mod streaming;
mod virtual_stream;

pub use config::*;
pub use context::*;
pub use decoder::*;
pub use engine::*;
pub use equalizer::*;
pub use metadata::*;
pub use mixer::*;
pub use output::*;
pub use preloader::*;
pub use ring_buffer::*;
pub use source::*;
pub use state::*;
pub use streaming::*;
pub use virtual_stream::*;
