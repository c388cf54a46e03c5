//! 音频核心模块
//!
//! 包含：
//! - Shared Buffer: 生产者与排空线程共享的环形缓冲区
//! - Cursor: 游标运算与环绕拆分
//! - Format: 码流格式识别
//! - Stats: 转发统计

pub mod cursor;
pub mod format;
pub mod shared_buffer;
pub mod stats;

pub use cursor::{Span, Spans};
pub use format::{classify, classify_info, FormatInfo, FormatTag};
pub use shared_buffer::{BufferError, SharedBuffer};
pub use stats::{ForwardStats, StatsReport};
