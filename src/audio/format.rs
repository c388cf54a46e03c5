//! 码流格式识别
//!
//! 只看数据块开头的同步字（sync word），不维护任何跨块状态。
//! 结果仅用于日志和统计，不影响是否转发：所有格式都会被原样转发。
//!
//! 判定顺序（固定优先级）：
//! 1. 长度 < 4 → Unknown
//! 2. 偏移 0 或 1 处出现 0x0B77 → AC3 / E-AC3（看 byte[2] 的 strmtyp）
//! 3. 0xF8726FBA / 0x72FBA870 → TrueHD
//! 4. 0x7FFE8001 / 0xFE7F0180 → DTS
//! 5. 其余一律视为 PCM

use std::fmt;

/// AC3 / E-AC3 同步字
const AC3_SYNC_WORD: u16 = 0x0B77;
/// TrueHD 同步字（两种字节序）
const TRUEHD_SYNC_WORDS: [u32; 2] = [0xF872_6FBA, 0x72FB_A870];
/// DTS 核心同步字（大端 / 16-bit 字节交换）
const DTS_SYNC_WORDS: [u32; 2] = [0x7FFE_8001, 0xFE7F_0180];

/// 码流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FormatTag {
    Unknown = 0,
    Pcm,
    Ac3,
    Eac3,
    TrueHd,
    Dts,
    DtsHd,
    Mat,
}

impl FormatTag {
    /// 格式总数（用于按格式计数的定长数组）
    pub const COUNT: usize = 8;

    pub const ALL: [FormatTag; Self::COUNT] = [
        Self::Unknown,
        Self::Pcm,
        Self::Ac3,
        Self::Eac3,
        Self::TrueHd,
        Self::Dts,
        Self::DtsHd,
        Self::Mat,
    ];

    /// 紧凑索引，可存入原子变量
    #[inline]
    pub fn index(self) -> u8 {
        self as u8
    }

    /// 从索引还原，越界时返回 Unknown
    pub fn from_index(index: u8) -> Self {
        Self::ALL
            .get(index as usize)
            .copied()
            .unwrap_or(Self::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Pcm => "PCM",
            Self::Ac3 => "AC3",
            Self::Eac3 => "E-AC3",
            Self::TrueHd => "TrueHD",
            Self::Dts => "DTS",
            Self::DtsHd => "DTS-HD",
            Self::Mat => "MAT",
        }
    }

    /// 是否为压缩码流（需要 passthrough）
    pub fn is_bitstream(self) -> bool {
        !matches!(self, Self::Unknown | Self::Pcm)
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 格式的标称参数
///
/// 查表得到的设计常量，不是从码流里测量的
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    pub tag: FormatTag,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u32,
    /// 粗略猜测：该格式家族可能承载 Atmos
    pub is_atmos_likely: bool,
    pub is_passthrough_recommended: bool,
}

impl FormatInfo {
    const fn entry(
        tag: FormatTag,
        sample_rate: u32,
        channels: u16,
        bit_rate: u32,
        is_atmos_likely: bool,
    ) -> Self {
        Self {
            tag,
            sample_rate,
            channels,
            bit_rate,
            is_atmos_likely,
            is_passthrough_recommended: true,
        }
    }

    /// 按格式查表
    pub fn for_tag(tag: FormatTag) -> Self {
        match tag {
            // MAT 没有独立的标称参数，与 Unknown 一样不建议直通
            FormatTag::Unknown | FormatTag::Mat => Self {
                tag,
                sample_rate: 0,
                channels: 0,
                bit_rate: 0,
                is_atmos_likely: false,
                is_passthrough_recommended: false,
            },
            FormatTag::Pcm => Self::entry(tag, 48_000, 2, 1_536_000, false),
            FormatTag::Ac3 => Self::entry(tag, 48_000, 6, 640_000, false),
            FormatTag::Eac3 => Self::entry(tag, 48_000, 8, 768_000, true),
            FormatTag::TrueHd => Self::entry(tag, 192_000, 8, 18_000_000, true),
            FormatTag::Dts => Self::entry(tag, 48_000, 6, 1_536_000, false),
            FormatTag::DtsHd => Self::entry(tag, 192_000, 8, 24_500_000, false),
        }
    }
}

impl fmt::Display for FormatInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {}Hz {}ch | {} kbps | Atmos: {} | Passthrough: {}",
            self.tag,
            self.sample_rate,
            self.channels,
            self.bit_rate / 1000,
            if self.is_atmos_likely { "likely" } else { "no" },
            if self.is_passthrough_recommended { "yes" } else { "no" },
        )
    }
}

/// 识别数据块的码流格式
///
/// 对任意长度输入都有定义，永不失败
pub fn classify(chunk: &[u8]) -> FormatTag {
    if chunk.len() < 4 {
        return FormatTag::Unknown;
    }

    // AC3 帧可能从偏移 0 或 1 开始
    let ac3_sync = (0..2).any(|offset| {
        u16::from_be_bytes([chunk[offset], chunk[offset + 1]]) == AC3_SYNC_WORD
    });
    if ac3_sync {
        // strmtyp 位于 byte[2] 的 bit[6:5]，0 / 2 为 E-AC3 独立流。
        // 不足 5 字节时不看 strmtyp，一律按 AC3
        if chunk.len() >= 5 {
            let strmtyp = (chunk[2] >> 5) & 0x3;
            if strmtyp == 0 || strmtyp == 2 {
                return FormatTag::Eac3;
            }
        }
        return FormatTag::Ac3;
    }

    let sync = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);

    if TRUEHD_SYNC_WORDS.contains(&sync) {
        return FormatTag::TrueHd;
    }

    if DTS_SYNC_WORDS.contains(&sync) {
        return FormatTag::Dts;
    }

    // 没有任何同步字：按 PCM 处理
    FormatTag::Pcm
}

/// 识别并查表
pub fn classify_info(chunk: &[u8]) -> FormatInfo {
    FormatInfo::for_tag(classify(chunk))
}
