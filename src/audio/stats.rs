//! 转发统计模块
//!
//! 在排空线程中收集统计信息，水位采用降频采样策略减少开销

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use super::format::FormatTag;

/// 统计采样间隔：每 N 次 tick 才采样一次水位
const SAMPLE_INTERVAL: u64 = 16;

/// 水位缓冲区大小
const WATER_LEVEL_BUFFER_SIZE: usize = 256;

/// 转发统计收集器
///
/// 所有操作都是 lock-free 的，可以在排空线程中随时调用
pub struct ForwardStats {
    tick_count: AtomicU64,
    idle_ticks: AtomicU64,

    bytes_forwarded: AtomicU64,
    spans_forwarded: AtomicU64,
    bytes_dropped: AtomicU64,
    spans_dropped: AtomicU64,
    // passthrough 关闭时只统计不发送
    bytes_skipped: AtomicU64,
    spans_skipped: AtomicU64,

    format_counts: [AtomicU64; FormatTag::COUNT],
    last_format: AtomicU8,
    has_format: AtomicBool,

    max_tick_ns: AtomicU64,

    // 积压水位（降频采样）
    water_level_buffer: Box<[AtomicUsize; WATER_LEVEL_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,
}

impl ForwardStats {
    pub fn new() -> Self {
        Self {
            tick_count: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            spans_forwarded: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            spans_dropped: AtomicU64::new(0),
            bytes_skipped: AtomicU64::new(0),
            spans_skipped: AtomicU64::new(0),
            format_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            last_format: AtomicU8::new(FormatTag::Unknown.index()),
            has_format: AtomicBool::new(false),
            max_tick_ns: AtomicU64::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
        }
    }

    /// 每次 tick 开始时调用
    ///
    /// `backlog`: 本次 tick 看到的可读字节数，只在采样点记录
    #[inline]
    pub fn on_tick(&self, backlog: usize) {
        let count = self.tick_count.fetch_add(1, Ordering::Relaxed);

        if backlog == 0 {
            self.idle_ticks.fetch_add(1, Ordering::Relaxed);
        }

        if count % SAMPLE_INTERVAL == 0 {
            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed)
                % WATER_LEVEL_BUFFER_SIZE;
            self.water_level_buffer[idx].store(backlog, Ordering::Relaxed);
        }
    }

    /// 记录本次 tick 耗时
    #[inline]
    pub fn record_tick_duration(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.max_tick_ns.fetch_max(ns, Ordering::Relaxed);
    }

    /// 记录一段数据的格式
    ///
    /// 返回上一段的格式（首段返回 None），用于检测格式切换
    #[inline]
    pub fn record_format(&self, tag: FormatTag) -> Option<FormatTag> {
        self.format_counts[tag.index() as usize].fetch_add(1, Ordering::Relaxed);
        let previous = self.last_format.swap(tag.index(), Ordering::Relaxed);
        if self.has_format.swap(true, Ordering::Relaxed) {
            Some(FormatTag::from_index(previous))
        } else {
            None
        }
    }

    #[inline]
    pub fn record_forwarded(&self, bytes: usize) {
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
        self.spans_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self, bytes: usize) {
        self.bytes_dropped.fetch_add(bytes as u64, Ordering::Relaxed);
        self.spans_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_skipped(&self, bytes: usize) {
        self.bytes_skipped.fetch_add(bytes as u64, Ordering::Relaxed);
        self.spans_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn spans_forwarded(&self) -> u64 {
        self.spans_forwarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    /// 最近一段数据的格式
    pub fn last_format(&self) -> Option<FormatTag> {
        if self.has_format.load(Ordering::Relaxed) {
            Some(FormatTag::from_index(self.last_format.load(Ordering::Relaxed)))
        } else {
            None
        }
    }

    /// 某种格式出现的段数
    pub fn format_count(&self, tag: FormatTag) -> u64 {
        self.format_counts[tag.index() as usize].load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        let mut water_levels: Vec<usize> = Vec::with_capacity(WATER_LEVEL_BUFFER_SIZE);
        for slot in self.water_level_buffer.iter() {
            water_levels.push(slot.load(Ordering::Relaxed));
        }
        // 只统计非零值
        water_levels.retain(|&l| l > 0);

        let water_stats = WaterLevelStats {
            min: water_levels.iter().copied().min().unwrap_or(0),
            max: water_levels.iter().copied().max().unwrap_or(0),
        };

        let formats = FormatTag::ALL
            .iter()
            .map(|&tag| (tag, self.format_count(tag)))
            .filter(|&(_, count)| count > 0)
            .collect();

        StatsReport {
            tick_count: self.tick_count.load(Ordering::Relaxed),
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
            sample_interval: SAMPLE_INTERVAL,
            bytes_forwarded: self.bytes_forwarded(),
            spans_forwarded: self.spans_forwarded(),
            bytes_dropped: self.bytes_dropped(),
            spans_dropped: self.spans_dropped(),
            bytes_skipped: self.bytes_skipped.load(Ordering::Relaxed),
            spans_skipped: self.spans_skipped.load(Ordering::Relaxed),
            formats,
            last_format: self.last_format(),
            max_tick: Duration::from_nanos(self.max_tick_ns.load(Ordering::Relaxed)),
            water_stats,
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.tick_count.store(0, Ordering::Relaxed);
        self.idle_ticks.store(0, Ordering::Relaxed);
        self.bytes_forwarded.store(0, Ordering::Relaxed);
        self.spans_forwarded.store(0, Ordering::Relaxed);
        self.bytes_dropped.store(0, Ordering::Relaxed);
        self.spans_dropped.store(0, Ordering::Relaxed);
        self.bytes_skipped.store(0, Ordering::Relaxed);
        self.spans_skipped.store(0, Ordering::Relaxed);
        self.last_format.store(FormatTag::Unknown.index(), Ordering::Relaxed);
        self.has_format.store(false, Ordering::Relaxed);
        self.max_tick_ns.store(0, Ordering::Relaxed);
        self.water_level_write_idx.store(0, Ordering::Relaxed);

        for count in self.format_counts.iter() {
            count.store(0, Ordering::Relaxed);
        }
        for slot in self.water_level_buffer.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ForwardStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub tick_count: u64,
    pub idle_ticks: u64,
    pub sample_interval: u64,
    pub bytes_forwarded: u64,
    pub spans_forwarded: u64,
    pub bytes_dropped: u64,
    pub spans_dropped: u64,
    pub bytes_skipped: u64,
    pub spans_skipped: u64,
    pub formats: Vec<(FormatTag, u64)>,
    pub last_format: Option<FormatTag>,
    pub max_tick: Duration,
    pub water_stats: WaterLevelStats,
}

#[derive(Debug)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Forwarding Statistics")?;
        writeln!(f, "=====================")?;
        writeln!(f, "Ticks: {} ({} idle)", self.tick_count, self.idle_ticks)?;
        writeln!(
            f,
            "Max tick duration: {:.2} ms",
            self.max_tick.as_secs_f64() * 1000.0
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "Forwarded: {} bytes in {} spans",
            self.bytes_forwarded, self.spans_forwarded
        )?;
        writeln!(
            f,
            "Dropped:   {} bytes in {} spans",
            self.bytes_dropped, self.spans_dropped
        )?;
        if self.spans_skipped > 0 {
            writeln!(
                f,
                "Skipped:   {} bytes in {} spans (passthrough disabled)",
                self.bytes_skipped, self.spans_skipped
            )?;
        }
        writeln!(f)?;

        writeln!(f, "Formats:")?;
        if self.formats.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for (tag, count) in &self.formats {
            writeln!(f, "  {:<8} {} spans", tag.name(), count)?;
        }
        if let Some(tag) = self.last_format {
            writeln!(f, "  Last: {}", tag)?;
        }
        writeln!(f)?;

        writeln!(
            f,
            "Backlog (sampled every {} ticks):",
            self.sample_interval
        )?;
        writeln!(f, "  Min: {} bytes", self.water_stats.min)?;
        writeln!(f, "  Max: {} bytes", self.water_stats.max)?;

        Ok(())
    }
}
