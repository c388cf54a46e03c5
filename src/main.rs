//! Cavern Egress - 音频码流转发工具
//!
//! 设计目标：
//! - 音频连续性优先：排空线程绝不反压生产者
//! - 码流原样转发：不解码、不重新编码
//! - 接收端可随时断开重连

use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use cavern_egress::audio::{classify, FormatInfo, FormatTag, SharedBuffer};
use cavern_egress::engine::{DrainEngine, EngineConfig};
use cavern_egress::transport::{PipeTransport, SinkAddress, Transport, TransportConfig};

/// 默认共享缓冲区大小（48KB）
const DEFAULT_BUFFER_BYTES: usize = 48 * 1024;

/// Cavern Egress - audio bitstream egress pipeline
#[derive(Parser)]
#[command(name = "cavern-egress")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a raw bitstream file through the shared buffer to the sink
    Forward(ForwardArgs),

    /// Classify a raw bitstream file chunk by chunk
    Classify {
        /// Raw audio file (PCM or compressed bitstream)
        file: PathBuf,

        /// Chunk size in bytes
        #[arg(short, long, default_value_t = 8192)]
        chunk_bytes: usize,
    },

    /// Show default configuration and the format table
    Info,
}

#[derive(clap::Args)]
struct ForwardArgs {
    /// Raw audio file (PCM or compressed bitstream)
    file: PathBuf,

    /// Unix socket path of the sink
    #[arg(long, conflicts_with = "tcp")]
    sink: Option<PathBuf>,

    /// TCP address of the sink
    #[arg(long)]
    tcp: Option<SocketAddr>,

    /// Shared buffer size in bytes
    #[arg(short, long, default_value_t = DEFAULT_BUFFER_BYTES)]
    buffer_bytes: usize,

    /// Producer rate in bytes per second (default: 48kHz 16-bit stereo)
    #[arg(short, long, default_value_t = 192_000)]
    rate: u64,

    /// Drain interval in milliseconds
    #[arg(short, long, default_value_t = 10)]
    interval_ms: u64,

    /// Maximum bytes forwarded per tick
    #[arg(short, long, default_value_t = 8192)]
    max_forward: usize,

    /// Classify and count only, do not send
    #[arg(long)]
    no_passthrough: bool,

    /// Lock the shared buffer in physical memory
    #[arg(long)]
    lock_memory: bool,
}

impl ForwardArgs {
    fn sink_address(&self) -> anyhow::Result<SinkAddress> {
        if let Some(ref path) = self.sink {
            return unix_sink(path);
        }
        Ok(match self.tcp {
            Some(addr) => SinkAddress::Tcp(addr),
            None => SinkAddress::default(),
        })
    }
}

#[cfg(unix)]
fn unix_sink(path: &Path) -> anyhow::Result<SinkAddress> {
    Ok(SinkAddress::Unix(path.to_path_buf()))
}

#[cfg(not(unix))]
fn unix_sink(path: &Path) -> anyhow::Result<SinkAddress> {
    anyhow::bail!("unix socket sinks are not supported here: {}", path.display())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Forward(ref args) => forward(args),
        Commands::Classify {
            ref file,
            chunk_bytes,
        } => classify_file(file, chunk_bytes),
        Commands::Info => {
            show_info();
            Ok(())
        }
    }
}

/// 转发模式：生产者线程按速率写入共享缓冲区，引擎排空到接收端
fn forward(args: &ForwardArgs) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    anyhow::ensure!(
        args.buffer_bytes >= 2,
        "buffer must hold at least 2 bytes (got {})",
        args.buffer_bytes
    );

    let file = File::open(&args.file)
        .with_context(|| format!("failed to open {}", args.file.display()))?;

    let buffer = Arc::new(SharedBuffer::allocate(args.buffer_bytes)?);
    if args.lock_memory && !buffer.lock_memory() {
        log::warn!("Continuing without locked buffer memory");
    }

    let transport_config = TransportConfig {
        sink: args.sink_address()?,
        ..TransportConfig::default()
    };
    println!("Cavern Egress - Forward Mode");
    println!("Source: {}", args.file.display());
    println!("Sink:   {}", transport_config.sink);
    println!("Buffer: {} bytes | Rate: {} B/s", buffer.capacity(), args.rate);
    println!("Press Ctrl+C to stop.\n");

    let transport = Arc::new(PipeTransport::from_config(transport_config));
    if let Err(e) = transport.connect() {
        // 接收端可以稍后再启动，发送时会自动重连
        println!("Sink not available yet ({}), will retry while streaming", e);
    }

    let config = EngineConfig {
        poll_interval: Duration::from_millis(args.interval_ms.max(1)),
        max_forward_size: args.max_forward,
        passthrough: !args.no_passthrough,
        ..EngineConfig::default()
    };
    let mut engine = DrainEngine::new(config, transport.clone());
    engine.start(Some(buffer.clone()))?;

    let producer_done = Arc::new(AtomicBool::new(false));
    let producer = {
        let buffer = buffer.clone();
        let running = running.clone();
        let done = producer_done.clone();
        let rate = args.rate.max(1);
        thread::Builder::new()
            .name("producer".to_string())
            .spawn(move || {
                if let Err(e) = producer_thread_main(file, &buffer, rate, &running) {
                    log::error!("Producer error: {}", e);
                }
                done.store(true, Ordering::Release);
            })?
    };

    // 等待：文件写完且积压排空，或用户中断
    while running.load(Ordering::SeqCst) {
        if producer_done.load(Ordering::Acquire) && buffer.available() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    if !running.load(Ordering::SeqCst) {
        println!("\nForwarding interrupted.");
    }
    running.store(false, Ordering::SeqCst);
    if producer.join().is_err() {
        log::error!("Producer thread panicked");
    }

    engine.stop();

    println!();
    print!("{}", engine.stats().report());
    println!(
        "Sink connects: {} | Reconnects: {}",
        transport.connect_count(),
        transport.reconnect_count()
    );

    Ok(())
}

/// 生产者线程：模拟硬件按固定速率写入 DMA buffer
fn producer_thread_main(
    mut file: File,
    buffer: &SharedBuffer,
    rate: u64,
    running: &AtomicBool,
) -> io::Result<()> {
    // 每 10ms 写入一块
    let period = Duration::from_millis(10);
    let chunk_size = ((rate / 100) as usize)
        .min(buffer.capacity() - 1)
        .max(1);
    let mut chunk = vec![0u8; chunk_size];
    let start = Instant::now();
    let mut written_total: u64 = 0;

    log::info!("Producer started, {} bytes per {:?}", chunk_size, period);

    while running.load(Ordering::Acquire) {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            log::info!("Producer reached end of file");
            break;
        }

        let mut offset = 0;
        while offset < n && running.load(Ordering::Acquire) {
            let written = buffer.write(&chunk[offset..n]);
            offset += written;
            if written == 0 {
                // 缓冲区满，等排空线程
                thread::sleep(Duration::from_millis(1));
            }
        }
        written_total += n as u64;

        // 按速率节流
        let target = Duration::from_secs_f64(written_total as f64 / rate as f64);
        let elapsed = start.elapsed();
        if target > elapsed {
            thread::sleep(target - elapsed);
        }
    }

    Ok(())
}

/// 分类模式：逐块识别并输出统计
fn classify_file(path: &PathBuf, chunk_bytes: usize) -> anyhow::Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut chunk = vec![0u8; chunk_bytes.max(1)];
    let mut counts = [0u64; FormatTag::COUNT];
    let mut first: Option<FormatInfo> = None;
    let mut total_bytes: u64 = 0;

    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let tag = classify(&chunk[..n]);
        counts[tag.index() as usize] += 1;
        total_bytes += n as u64;
        if first.is_none() {
            first = Some(FormatInfo::for_tag(tag));
        }
    }

    println!("File:   {}", path.display());
    println!("Size:   {} bytes ({} byte chunks)", total_bytes, chunk_bytes);
    match first {
        Some(info) => println!("First:  {}", info),
        None => println!("First:  (empty file)"),
    }
    println!("\nChunks by format:");
    for tag in FormatTag::ALL {
        let count = counts[tag.index() as usize];
        if count > 0 {
            println!("  {:<8} {}", tag.name(), count);
        }
    }

    Ok(())
}

/// 显示默认配置与格式表
fn show_info() {
    let engine = EngineConfig::default();
    let transport = TransportConfig::default();

    println!("=== Defaults ===\n");
    println!("Sink:             {}", transport.sink);
    println!("Connect timeout:  {:?}", transport.connect_timeout);
    println!("Write timeout:    {:?}", transport.write_timeout);
    println!("Poll interval:    {:?}", engine.poll_interval);
    println!("Max forward size: {} bytes", engine.max_forward_size);
    println!("Stop timeout:     {:?}", engine.stop_timeout);
    println!("Buffer size:      {} bytes", DEFAULT_BUFFER_BYTES);

    println!("\n=== Formats ===\n");
    for tag in FormatTag::ALL {
        println!("{}", FormatInfo::for_tag(tag));
    }
}
