//! # tag 模块说明
//!
//! ## 角色定位（Why）
//! - 标签匹配式后端只认识一个 64 位整数，它既要携带应用的逻辑标签，又要携带来源 rank，
//!   否则不同来源、相同逻辑标签的消息会被错误地配对；
//! - 本模块把“逻辑标签 + 来源 rank”打包为 [`WireTag`]，并给出与之配套的匹配掩码 [`WireMask`]。
//!
//! ## 编码契约（What）
//! - 位 63..32 存放逻辑标签，位 31..0 存放来源 rank；
//! - 发送方写入“自己的” rank，接收方写入“期望来源”的 rank，两侧编码结果逐位相等即视为匹配；
//! - 掩码恒为全 64 位，当前设计不提供通配来源或通配标签；
//! - 逻辑标签最高位（`0x8000_0000`）保留给协议内部，其中 [`SENTINEL_TAG`] 专用于优雅关闭的哨兵消息。
//!
//! ## 风险提示（Trade-offs）
//! - rank 被截断到 32 位，超过 `u32::MAX` 个进程的作业无法表示；这在可预见的规模内不是问题。

use core::fmt;

/// 进程在通信域内的编号，取值 `[0, size)`。
pub type Rank = u32;

/// 应用可见的逻辑标签。
pub type Tag = u32;

/// 逻辑标签中保留给协议内部的最高位。
pub const RESERVED_TAG_BIT: Tag = 0x8000_0000;

/// 优雅关闭流程使用的哨兵标签，应用不得使用。
pub const SENTINEL_TAG: Tag = RESERVED_TAG_BIT;

/// 判断逻辑标签是否落在保留区间。
#[inline]
pub const fn is_reserved(tag: Tag) -> bool {
    tag & RESERVED_TAG_BIT != 0
}

/// 后端可见的 64 位线标签。
///
/// # 教案式说明
/// - **意图 (Why)**：把来源身份编码进标签，使“只按标签匹配”的后端也能区分来源；
/// - **契约 (What)**：`WireTag::new(tag, rank).tag() == tag` 且 `.rank() == rank`，对全部 `u32` 取值成立；
/// - **逻辑 (How)**：`(tag << 32) | rank`，解码时分别右移与截断。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WireTag(u64);

impl WireTag {
    /// 由逻辑标签与 rank 组装线标签。
    #[inline]
    pub const fn new(tag: Tag, rank: Rank) -> Self {
        Self(((tag as u64) << 32) | rank as u64)
    }

    /// 从后端上报的原始 64 位值恢复线标签。
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 原始 64 位值，用于交给后端。
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// 解码逻辑标签（高 32 位）。
    #[inline]
    pub const fn tag(self) -> Tag {
        (self.0 >> 32) as Tag
    }

    /// 解码来源 rank（低 32 位）。
    #[inline]
    pub const fn rank(self) -> Rank {
        self.0 as Rank
    }

    /// 在给定掩码下判断两枚线标签是否匹配：`(a & mask) == (b & mask)`。
    #[inline]
    pub const fn matches(self, other: WireTag, mask: WireMask) -> bool {
        (self.0 & mask.0) == (other.0 & mask.0)
    }
}

impl fmt::Debug for WireTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WireTag(tag={:#x}, rank={})", self.tag(), self.rank())
    }
}

/// 线标签匹配掩码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WireMask(u64);

impl WireMask {
    /// 全 64 位精确匹配，是本层唯一使用的掩码。
    pub const EXACT: WireMask = WireMask(u64::MAX);

    /// 原始掩码值。
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl Default for WireMask {
    fn default() -> Self {
        Self::EXACT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn encoded_tag_decodes_to_its_parts(tag in any::<u32>(), rank in any::<u32>()) {
            let wire = WireTag::new(tag, rank);
            prop_assert_eq!(wire.tag(), tag);
            prop_assert_eq!(wire.rank(), rank);
            prop_assert_eq!(WireTag::from_raw(wire.raw()), wire);
        }

        #[test]
        fn exact_mask_separates_sources(tag in any::<u32>(), a in any::<u32>(), b in any::<u32>()) {
            let same = WireTag::new(tag, a).matches(WireTag::new(tag, b), WireMask::EXACT);
            prop_assert_eq!(same, a == b);
        }
    }

    #[test]
    fn sentinel_lives_in_reserved_range() {
        assert!(is_reserved(SENTINEL_TAG));
        assert!(!is_reserved(0x7fff_ffff));
        assert_eq!(WireTag::new(SENTINEL_TAG, 3).raw(), 0x8000_0000_0000_0003);
    }
}
