//! 排空引擎
//!
//! 整合共享缓冲区、格式识别、传输各模块
//! 核心设计：排空线程按固定周期轮询写游标，生产者没有任何唤醒信号。
//! 读游标无论发送成功与否都会前进：宁可丢数据，也不反压生产者

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::audio::{cursor, format, ForwardStats, SharedBuffer};
use crate::transport::Transport;

/// 单次 tick 最多转发的字节数
pub const MAX_FORWARD_SIZE: usize = 8192;

/// 默认轮询周期
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 默认停止等待时间
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrainState {
    /// 线程未启动
    Idle = 0,
    /// 线程运行，等待下一个周期
    Running,
    /// 正在处理一次 tick
    Draining,
    /// 已请求停止，线程正在结束当前 tick
    Stopping,
    /// 线程已退出
    Stopped,
}

impl DrainState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 轮询周期
    pub poll_interval: Duration,
    /// 单次 tick 最多转发的字节数，限制每个 tick 的延迟
    pub max_forward_size: usize,
    /// 积压低于该值时本次 tick 不处理（0 = 有数据就处理）
    pub forward_threshold: usize,
    /// stop() 等待线程退出的最长时间
    pub stop_timeout: Duration,
    /// 关闭后只识别和计数，不发送
    pub passthrough: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_forward_size: MAX_FORWARD_SIZE,
            forward_threshold: 0,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            passthrough: true,
        }
    }
}

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("drain engine already running")]
    AlreadyRunning,
    #[error("no audio buffer bound")]
    NoBuffer,
    #[error("failed to spawn drain thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

/// 排空线程共享状态
struct DrainShared {
    /// 是否应该继续运行
    running: AtomicBool,
    state: AtomicU8,
    /// 缓冲区可能在引擎启动之后才分配好
    buffer: Mutex<Option<Arc<SharedBuffer>>>,
}

impl DrainShared {
    fn set_state(&self, state: DrainState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> DrainState {
        DrainState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn buffer(&self) -> Option<Arc<SharedBuffer>> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// tick 主体：把一次积压搬运到传输层
struct Drainer {
    transport: Arc<dyn Transport>,
    stats: Arc<ForwardStats>,
    max_forward_size: usize,
    forward_threshold: usize,
    passthrough: bool,
    /// 上一次发送是否成功，用于边沿触发日志
    sink_healthy: AtomicBool,
}

impl Drainer {
    fn new(config: &EngineConfig, transport: Arc<dyn Transport>, stats: Arc<ForwardStats>) -> Self {
        Self {
            transport,
            stats,
            max_forward_size: config.max_forward_size.max(1),
            forward_threshold: config.forward_threshold,
            passthrough: config.passthrough,
            sink_healthy: AtomicBool::new(true),
        }
    }

    /// 执行一次 tick，返回读游标前进的字节数
    fn drain(&self, buffer: &SharedBuffer) -> usize {
        let capacity = buffer.capacity();
        let write = buffer.write_cursor();
        let read = buffer.read_cursor();

        let available = cursor::available(read, write, capacity);
        self.stats.on_tick(available);

        if available == 0 || available < self.forward_threshold {
            return 0;
        }

        let process_size = available.min(self.max_forward_size);
        let spans = cursor::spans_for(read, process_size, capacity);

        for span in spans.iter() {
            let bytes = buffer.span_bytes(&span);

            // 格式只用于日志和统计
            let tag = format::classify(bytes);
            if let Some(previous) = self.stats.record_format(tag) {
                if previous != tag {
                    log::info!("Format changed: {} -> {}", previous, tag);
                }
            } else {
                log::info!("Format detected: {}", format::FormatInfo::for_tag(tag));
            }

            if !self.passthrough {
                self.stats.record_skipped(bytes.len());
                continue;
            }

            match self.transport.send(bytes) {
                Ok(()) => {
                    self.stats.record_forwarded(bytes.len());
                    if !self.sink_healthy.swap(true, Ordering::Relaxed) {
                        log::info!("Forwarding resumed");
                    }
                }
                Err(e) => {
                    self.stats.record_dropped(bytes.len());
                    if self.sink_healthy.swap(false, Ordering::Relaxed) {
                        log::warn!("Dropping audio, sink unreachable: {}", e);
                    } else {
                        log::debug!("Dropped {} bytes: {}", bytes.len(), e);
                    }
                }
            }
        }

        // 不论发送结果如何都前进
        buffer.set_read_cursor(cursor::advance(read, process_size, capacity));
        process_size
    }
}

/// 排空引擎
pub struct DrainEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    stats: Arc<ForwardStats>,
    shared: Arc<DrainShared>,
    drain_thread: Option<JoinHandle<()>>,
}

impl DrainEngine {
    /// 创建新引擎
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(DrainShared {
            running: AtomicBool::new(false),
            state: AtomicU8::new(DrainState::Idle as u8),
            buffer: Mutex::new(None),
        });

        Self {
            config,
            transport,
            stats: Arc::new(ForwardStats::new()),
            shared,
            drain_thread: None,
        }
    }

    /// 绑定缓冲区（可在 start 之后调用）
    pub fn bind_buffer(&self, buffer: Arc<SharedBuffer>) {
        log::debug!("Buffer bound: {} bytes", buffer.capacity());
        *self
            .shared
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(buffer);
    }

    /// 解除缓冲区绑定，之后的 tick 都是空操作
    pub fn unbind_buffer(&self) -> Option<Arc<SharedBuffer>> {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// 启动排空线程
    ///
    /// `buffer` 为 None 时线程照常启动，等待 `bind_buffer`
    pub fn start(&mut self, buffer: Option<Arc<SharedBuffer>>) -> Result<(), EngineError> {
        if self.drain_thread.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        if let Some(buffer) = buffer {
            self.bind_buffer(buffer);
        }

        self.shared.running.store(true, Ordering::Release);
        self.shared.set_state(DrainState::Running);

        let shared = Arc::clone(&self.shared);
        let drainer = Drainer::new(
            &self.config,
            Arc::clone(&self.transport),
            Arc::clone(&self.stats),
        );
        let poll_interval = self.config.poll_interval;

        let spawned = thread::Builder::new()
            .name("cavern-drain".to_string())
            .spawn(move || {
                Self::drain_thread_main(drainer, shared, poll_interval);
            });

        match spawned {
            Ok(handle) => {
                self.drain_thread = Some(handle);
                log::info!(
                    "Drain engine started: interval={}ms, max_forward={} bytes",
                    poll_interval.as_millis(),
                    self.config.max_forward_size
                );
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_state(DrainState::Idle);
                Err(EngineError::ThreadSpawn(e))
            }
        }
    }

    /// 排空线程主函数
    ///
    /// 固定周期轮询：tick 之后用 park_timeout 睡完剩余周期，
    /// stop() 通过 unpark 提前唤醒
    fn drain_thread_main(drainer: Drainer, shared: Arc<DrainShared>, poll_interval: Duration) {
        log::debug!("Drain thread started");

        while shared.running.load(Ordering::Acquire) {
            let tick_start = Instant::now();

            if let Some(buffer) = shared.buffer() {
                // stop() 可能已经把状态改成 Stopping，此时不能覆盖
                let entered = shared.state.compare_exchange(
                    DrainState::Running as u8,
                    DrainState::Draining as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if entered.is_err() {
                    break;
                }
                drainer.drain(&buffer);
                drainer.stats.record_tick_duration(tick_start.elapsed());

                // 只有仍在运行时才回到 Running，避免覆盖 Stopping
                let _ = shared.state.compare_exchange(
                    DrainState::Draining as u8,
                    DrainState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }

            // 睡完本周期剩余时间（park 可能被提前唤醒）
            let deadline = tick_start + poll_interval;
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }
        }

        shared.set_state(DrainState::Stopped);
        log::debug!("Drain thread finished");
    }

    /// 停止排空线程
    ///
    /// 正在进行的 tick 会完整结束；超时后放弃等待（线程被分离）
    pub fn stop(&mut self) {
        let Some(handle) = self.drain_thread.take() else {
            return;
        };

        self.shared.running.store(false, Ordering::Release);
        self.shared.set_state(DrainState::Stopping);
        handle.thread().unpark();

        let deadline = Instant::now() + self.config.stop_timeout;
        let backoff = Backoff::new();
        while !handle.is_finished() && Instant::now() < deadline {
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                log::error!("Drain thread panicked");
            }
            self.shared.set_state(DrainState::Stopped);
        } else {
            // 线程仍持有共享状态的引用，只能分离
            log::warn!(
                "Drain thread did not exit within {:?}, detaching",
                self.config.stop_timeout
            );
        }

        self.transport.disconnect();
        log::info!("Drain engine stopped");
    }

    /// 在当前线程同步执行一次 tick
    ///
    /// 返回读游标前进的字节数；排空线程运行时不允许调用
    pub fn drain_once(&self) -> Result<usize, EngineError> {
        if self.drain_thread.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let buffer = self.shared.buffer().ok_or(EngineError::NoBuffer)?;
        let drainer = Drainer::new(
            &self.config,
            Arc::clone(&self.transport),
            Arc::clone(&self.stats),
        );
        Ok(drainer.drain(&buffer))
    }

    /// 获取当前状态
    pub fn state(&self) -> DrainState {
        self.shared.state()
    }

    /// 检查排空线程是否在运行
    pub fn is_running(&self) -> bool {
        self.drain_thread.is_some()
    }

    /// 获取统计信息
    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for DrainEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    /// 记录每次 send 的传输
    #[derive(Default)]
    struct RecordingTransport {
        sends: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
        disconnects: std::sync::atomic::AtomicUsize,
    }

    impl RecordingTransport {
        fn sends(&self) -> Vec<Vec<u8>> {
            self.sends.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&self, data: &[u8]) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.sends.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn engine_with(
        config: EngineConfig,
    ) -> (DrainEngine, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let engine = DrainEngine::new(config, transport.clone());
        (engine, transport)
    }

    fn buffer_with_cursors(capacity: usize, read: usize, write: usize) -> Arc<SharedBuffer> {
        let buffer = Arc::new(SharedBuffer::allocate(capacity).unwrap());
        buffer.set_read_cursor(read);
        buffer.set_write_cursor(write);
        buffer
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.max_forward_size, 8192);
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert!(config.passthrough);
    }

    #[test]
    fn test_single_span_tick() {
        let (engine, transport) = engine_with(EngineConfig::default());
        let buffer = buffer_with_cursors(100, 80, 90);
        engine.bind_buffer(buffer.clone());

        assert_eq!(engine.drain_once().unwrap(), 10);
        assert_eq!(buffer.read_cursor(), 90);

        let sends = transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0], vec![0u8; 10]);
        assert_eq!(engine.stats().last_format(), Some(format::FormatTag::Pcm));
    }

    #[test]
    fn test_wrapped_tick() {
        let (engine, transport) = engine_with(EngineConfig::default());
        let buffer = buffer_with_cursors(100, 95, 5);
        engine.bind_buffer(buffer.clone());

        assert_eq!(engine.drain_once().unwrap(), 10);
        assert_eq!(buffer.read_cursor(), 5);

        let lens: Vec<usize> = transport.sends().iter().map(Vec::len).collect();
        assert_eq!(lens, vec![5, 5]);
    }

    #[test]
    fn test_tick_preserves_byte_order_across_wrap() {
        let (engine, transport) = engine_with(EngineConfig::default());
        let buffer = buffer_with_cursors(8, 6, 6);
        assert_eq!(buffer.write(&[1, 2, 3, 4, 5]), 5);
        engine.bind_buffer(buffer);

        engine.drain_once().unwrap();
        let joined: Vec<u8> = transport.sends().concat();
        assert_eq!(joined, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_tick_clamps_to_max_forward_size() {
        let config = EngineConfig {
            max_forward_size: 16,
            ..EngineConfig::default()
        };
        let (engine, _transport) = engine_with(config);
        let buffer = buffer_with_cursors(100, 0, 50);
        engine.bind_buffer(buffer.clone());

        assert_eq!(engine.drain_once().unwrap(), 16);
        assert_eq!(buffer.read_cursor(), 16);
        assert_eq!(engine.drain_once().unwrap(), 16);
        assert_eq!(buffer.read_cursor(), 32);
    }

    #[test]
    fn test_cursor_advances_when_send_fails() {
        let (engine, transport) = engine_with(EngineConfig::default());
        transport.fail.store(true, Ordering::SeqCst);
        let buffer = buffer_with_cursors(100, 95, 5);
        engine.bind_buffer(buffer.clone());

        assert_eq!(engine.drain_once().unwrap(), 10);
        assert_eq!(buffer.read_cursor(), 5);

        let stats = engine.stats();
        assert_eq!(stats.spans_dropped(), 2);
        assert_eq!(stats.bytes_dropped(), 10);
        assert_eq!(stats.spans_forwarded(), 0);
    }

    #[test]
    fn test_passthrough_disabled_skips_send() {
        let config = EngineConfig {
            passthrough: false,
            ..EngineConfig::default()
        };
        let (engine, transport) = engine_with(config);
        let buffer = buffer_with_cursors(100, 0, 40);
        engine.bind_buffer(buffer.clone());

        assert_eq!(engine.drain_once().unwrap(), 40);
        assert!(transport.sends().is_empty());
        assert_eq!(buffer.read_cursor(), 40);
        assert_eq!(engine.stats().report().bytes_skipped, 40);
    }

    #[test]
    fn test_forward_threshold() {
        let config = EngineConfig {
            forward_threshold: 32,
            ..EngineConfig::default()
        };
        let (engine, transport) = engine_with(config);
        let buffer = buffer_with_cursors(100, 0, 10);
        engine.bind_buffer(buffer.clone());

        assert_eq!(engine.drain_once().unwrap(), 0);
        assert_eq!(buffer.read_cursor(), 0);

        buffer.set_write_cursor(40);
        assert_eq!(engine.drain_once().unwrap(), 40);
        assert_eq!(transport.sends().len(), 1);
    }

    #[test]
    fn test_empty_buffer_is_noop() {
        let (engine, transport) = engine_with(EngineConfig::default());
        let buffer = buffer_with_cursors(64, 17, 17);
        engine.bind_buffer(buffer.clone());

        assert_eq!(engine.drain_once().unwrap(), 0);
        assert_eq!(buffer.read_cursor(), 17);
        assert!(transport.sends().is_empty());
    }

    #[test]
    fn test_drain_once_without_buffer() {
        let (engine, _transport) = engine_with(EngineConfig::default());
        assert!(matches!(engine.drain_once(), Err(EngineError::NoBuffer)));
    }

    #[test]
    fn test_start_twice_fails() {
        let (mut engine, _transport) = engine_with(EngineConfig::default());
        engine.start(None).unwrap();
        assert!(matches!(engine.start(None), Err(EngineError::AlreadyRunning)));
        assert!(matches!(engine.drain_once(), Err(EngineError::AlreadyRunning)));
        engine.stop();
        assert_eq!(engine.state(), DrainState::Stopped);
    }

    #[test]
    fn test_thread_drains_late_bound_buffer() {
        let config = EngineConfig {
            poll_interval: Duration::from_millis(1),
            max_forward_size: 64,
            ..EngineConfig::default()
        };
        let (mut engine, transport) = engine_with(config);
        engine.start(None).unwrap();
        assert!(engine.is_running());

        // 缓冲区晚于引擎启动
        thread::sleep(Duration::from_millis(5));
        let buffer = Arc::new(SharedBuffer::allocate(256).unwrap());
        engine.bind_buffer(buffer.clone());

        let payload: Vec<u8> = (0..200u8).collect();
        assert_eq!(buffer.write(&payload), 200);

        let deadline = Instant::now() + Duration::from_secs(5);
        while buffer.available() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.state(), DrainState::Stopped);
        assert_eq!(buffer.read_cursor(), 200);

        // 每次 send 都不超过 max_forward_size，且顺序不变
        let sends = transport.sends();
        assert!(sends.iter().all(|s| s.len() <= 64));
        assert_eq!(sends.concat(), payload);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_advance_after_stop() {
        let config = EngineConfig {
            poll_interval: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let (mut engine, _transport) = engine_with(config);
        let buffer = Arc::new(SharedBuffer::allocate(128).unwrap());
        engine.start(Some(buffer.clone())).unwrap();
        engine.stop();

        assert_eq!(buffer.write(&[1, 2, 3]), 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.read_cursor(), 0);
        assert_eq!(buffer.available(), 3);
    }

    /// send 阻塞很久的传输，用于测试停止超时
    #[derive(Default)]
    struct SlowTransport {
        entered: AtomicBool,
        disconnects: std::sync::atomic::AtomicUsize,
    }

    impl Transport for SlowTransport {
        fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&self, _data: &[u8]) -> Result<(), TransportError> {
            self.entered.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(800));
            Ok(())
        }

        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_stop_detaches_thread_after_timeout() {
        let config = EngineConfig {
            poll_interval: Duration::from_millis(1),
            stop_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let transport = Arc::new(SlowTransport::default());
        let mut engine = DrainEngine::new(config, transport.clone());
        let buffer = Arc::new(SharedBuffer::allocate(64).unwrap());
        assert_eq!(buffer.write(&[1, 2, 3, 4]), 4);
        engine.start(Some(buffer)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !transport.entered.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(transport.entered.load(Ordering::SeqCst));

        let started = Instant::now();
        engine.stop();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(700), "stop took {:?}", elapsed);
        assert!(!engine.is_running());
        // 线程被分离，状态停在 Stopping
        assert_eq!(engine.state(), DrainState::Stopping);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tick_does_not_overwrite_stopping() {
        // stop() 发生在 running 检查之后、tick 开始之前
        let buffer = buffer_with_cursors(64, 0, 10);
        let shared = Arc::new(DrainShared {
            running: AtomicBool::new(true),
            state: AtomicU8::new(DrainState::Stopping as u8),
            buffer: Mutex::new(Some(buffer.clone())),
        });
        let transport = Arc::new(RecordingTransport::default());
        let drainer = Drainer::new(
            &EngineConfig::default(),
            transport.clone(),
            Arc::new(ForwardStats::new()),
        );

        DrainEngine::drain_thread_main(drainer, shared.clone(), Duration::from_millis(1));

        assert_eq!(shared.state(), DrainState::Stopped);
        assert_eq!(buffer.read_cursor(), 0);
        assert!(transport.sends().is_empty());
    }

    #[test]
    fn test_stop_is_idempotent_and_restartable() {
        let (mut engine, _transport) = engine_with(EngineConfig::default());
        engine.stop();
        assert_eq!(engine.state(), DrainState::Idle);

        engine.start(None).unwrap();
        engine.stop();
        engine.stop();
        engine.start(None).unwrap();
        assert!(engine.is_running());
    }
}
