//! 环形缓冲区游标运算
//!
//! 把线性的"可读字节数"转换为 1~2 段连续区间（处理环绕），不拷贝数据。
//! 所有函数都是纯函数，调用方保证自己是读游标的唯一修改者。

/// 缓冲区内的一段连续区间（不跨越环绕点）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// 区间结束位置（不含）
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 一次读取对应的区间：环绕时拆成两段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Spans {
    pub first: Span,
    pub second: Option<Span>,
}

impl Spans {
    /// 总字节数
    #[inline]
    pub fn len(&self) -> usize {
        self.first.len + self.second.map_or(0, |s| s.len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否发生了环绕
    #[inline]
    pub fn is_wrapped(&self) -> bool {
        self.second.is_some()
    }

    /// 按顺序遍历各段
    pub fn iter(&self) -> impl Iterator<Item = Span> {
        std::iter::once(self.first).chain(self.second)
    }
}

/// 可读字节数 = (write - read) mod capacity
#[inline]
pub fn available(read: usize, write: usize, capacity: usize) -> usize {
    assert!(capacity > 0, "capacity must be non-zero");
    debug_assert!(read < capacity && write < capacity);
    (write + capacity - read) % capacity
}

/// 计算从 `read` 开始读取 `delta` 字节对应的区间
///
/// `delta` 超过 `capacity` 属于调用方的编程错误，直接 panic
pub fn spans_for(read: usize, delta: usize, capacity: usize) -> Spans {
    assert!(capacity > 0, "capacity must be non-zero");
    assert!(read < capacity, "read cursor {} out of range (capacity {})", read, capacity);
    assert!(delta <= capacity, "delta {} exceeds capacity {}", delta, capacity);

    if read + delta <= capacity {
        return Spans {
            first: Span::new(read, delta),
            second: None,
        };
    }

    let first_len = capacity - read;
    Spans {
        first: Span::new(read, first_len),
        second: Some(Span::new(0, delta - first_len)),
    }
}

/// 推进读游标
#[inline]
pub fn advance(read: usize, delta: usize, capacity: usize) -> usize {
    assert!(capacity > 0, "capacity must be non-zero");
    (read + delta) % capacity
}
