//! 共享环形缓冲区（模拟硬件 DMA buffer）
//!
//! 设计目标：
//! - 零锁：生产者只写 write cursor，排空线程只写 read cursor
//! - 零分配：所有内存在分配时一次性预留，分配失败向上报告
//! - 缓存友好：两个游标各自独占一个 cache line，避免 false sharing
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 游标始终取模 capacity，因此"满"与"空"无法区分，
//! 生产者最多只能写入 capacity - 1 字节的积压

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::cursor::{self, Span};

/// 缓冲区分配错误
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer size must be non-zero")]
    InvalidSize,
    #[error("failed to allocate {size} byte audio buffer")]
    AllocationFailed { size: usize },
}

/// 生产者与排空线程共享的字节环形缓冲区
pub struct SharedBuffer {
    data: Box<[UnsafeCell<u8>]>,
    capacity: usize,

    write_cursor: CachePadded<AtomicUsize>,
    read_cursor: CachePadded<AtomicUsize>,

    memory_locked: AtomicBool,
}

// 每个游标只有一个修改者；读取对方游标时使用 Acquire 快照
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// 分配指定大小的缓冲区
    ///
    /// 实际大小通过 `capacity()` 获取
    pub fn allocate(size: usize) -> Result<Self, BufferError> {
        if size == 0 {
            return Err(BufferError::InvalidSize);
        }

        let mut data: Vec<UnsafeCell<u8>> = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| BufferError::AllocationFailed { size })?;
        data.extend((0..size).map(|_| UnsafeCell::new(0)));

        log::debug!("Shared buffer allocated: {} bytes", size);

        Ok(Self {
            data: data.into_boxed_slice(),
            capacity: size,
            write_cursor: CachePadded::new(AtomicUsize::new(0)),
            read_cursor: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        })
    }

    /// 获取容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 写游标快照
    #[inline]
    pub fn write_cursor(&self) -> usize {
        self.write_cursor.load(Ordering::Acquire)
    }

    /// 读游标快照
    #[inline]
    pub fn read_cursor(&self) -> usize {
        self.read_cursor.load(Ordering::Acquire)
    }

    /// 当前可读字节数
    #[inline]
    pub fn available(&self) -> usize {
        cursor::available(self.read_cursor(), self.write_cursor(), self.capacity)
    }

    /// 当前可写空间
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - 1 - self.available()
    }

    /// 写入数据（生产者调用）
    ///
    /// 返回实际写入的字节数，不会覆盖尚未排空的数据。
    /// 此函数是 wait-free 的，绝不阻塞
    pub fn write(&self, data: &[u8]) -> usize {
        let write = self.write_cursor.load(Ordering::Relaxed);
        let read = self.read_cursor.load(Ordering::Acquire);

        let free = self.capacity - 1 - cursor::available(read, write, self.capacity);
        let to_write = data.len().min(free);
        if to_write == 0 {
            return 0;
        }

        let mut copied = 0;
        for span in cursor::spans_for(write, to_write, self.capacity).iter() {
            // SAFETY: span 位于 [0, capacity) 内，且处在 [write, read) 的空闲区，
            // 排空线程不会读取这段内存
            unsafe {
                let dst = UnsafeCell::raw_get(self.data.as_ptr().add(span.offset));
                std::ptr::copy_nonoverlapping(data[copied..].as_ptr(), dst, span.len);
            }
            copied += span.len;
        }

        self.write_cursor.store(
            cursor::advance(write, to_write, self.capacity),
            Ordering::Release,
        );
        to_write
    }

    /// 直接设置写游标（模拟硬件位置寄存器，生产者调用）
    pub fn set_write_cursor(&self, position: usize) {
        self.write_cursor.store(position % self.capacity, Ordering::Release);
    }

    /// 设置读游标（只允许排空线程调用）
    pub fn set_read_cursor(&self, position: usize) {
        self.read_cursor.store(position % self.capacity, Ordering::Release);
    }

    /// 获取一段区间的只读视图（零拷贝）
    ///
    /// # 前置条件
    ///
    /// span 必须位于已发布的数据中（read cursor 与 write cursor 之间），
    /// 且视图存活期间读游标不能前进，否则生产者会覆写同一段内存。
    /// 只有排空线程满足这一点，因此不对外公开。
    ///
    /// # Panics
    ///
    /// span 超出容量（包括 offset + len 溢出）时 panic
    pub(crate) fn span_bytes(&self, span: &Span) -> &[u8] {
        let in_range = span
            .offset
            .checked_add(span.len)
            .is_some_and(|end| end <= self.capacity);
        assert!(
            in_range,
            "span {:?} out of range (capacity {})",
            span,
            self.capacity
        );

        // SAFETY: UnsafeCell<u8> 与 u8 布局相同；范围已检查。
        // 生产者只写 write cursor 之后的空闲区，不会与已发布的数据重叠
        unsafe {
            let ptr = UnsafeCell::raw_get(self.data.as_ptr().add(span.offset)) as *const u8;
            std::slice::from_raw_parts(ptr, span.len)
        }
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    #[cfg(unix)]
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true; // 已经锁定
        }

        let ptr = self.data.as_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.capacity) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Shared buffer memory locked: {} bytes", self.capacity);
            true
        } else {
            log::warn!(
                "Failed to lock shared buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    #[cfg(not(unix))]
    pub fn lock_memory(&self) -> bool {
        false
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::munlock(self.data.as_ptr() as *const libc::c_void, self.capacity);
        }

        log::debug!("Shared buffer memory unlocked");
    }

    /// 检查内存是否已锁定
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zero_size() {
        assert!(matches!(
            SharedBuffer::allocate(0),
            Err(BufferError::InvalidSize)
        ));
    }

    #[test]
    fn test_write_and_view() {
        let buffer = SharedBuffer::allocate(16).unwrap();
        assert_eq!(buffer.capacity(), 16);

        assert_eq!(buffer.write(&[1, 2, 3, 4]), 4);
        assert_eq!(buffer.available(), 4);
        assert_eq!(buffer.write_cursor(), 4);
        assert_eq!(buffer.span_bytes(&Span::new(0, 4)), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_write_wraps() {
        let buffer = SharedBuffer::allocate(8).unwrap();
        buffer.set_write_cursor(6);
        buffer.set_read_cursor(6);

        assert_eq!(buffer.write(&[10, 11, 12, 13]), 4);
        assert_eq!(buffer.write_cursor(), 2);
        assert_eq!(buffer.span_bytes(&Span::new(6, 2)), &[10, 11]);
        assert_eq!(buffer.span_bytes(&Span::new(0, 2)), &[12, 13]);
    }

    #[test]
    fn test_write_never_overruns_reader() {
        let buffer = SharedBuffer::allocate(4).unwrap();

        // 最多写入 capacity - 1
        assert_eq!(buffer.write(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(buffer.free_space(), 0);
        assert_eq!(buffer.write(&[6]), 0);

        buffer.set_read_cursor(2);
        assert_eq!(buffer.free_space(), 2);
        assert_eq!(buffer.write(&[6, 7]), 2);
        assert_eq!(buffer.available(), 3);
    }

    #[test]
    fn test_cursors_stay_in_range() {
        let buffer = SharedBuffer::allocate(100).unwrap();
        buffer.set_write_cursor(205);
        assert_eq!(buffer.write_cursor(), 5);
        buffer.set_read_cursor(100);
        assert_eq!(buffer.read_cursor(), 0);
    }

    #[test]
    #[should_panic]
    fn test_span_out_of_range() {
        let buffer = SharedBuffer::allocate(8).unwrap();
        buffer.span_bytes(&Span::new(6, 4));
    }

    #[test]
    #[should_panic]
    fn test_span_end_overflow() {
        // offset + len 溢出后不能绕过范围检查
        let buffer = SharedBuffer::allocate(8).unwrap();
        buffer.span_bytes(&Span::new(usize::MAX - 4096, 4098));
    }
}
