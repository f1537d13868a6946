//! xblock 서버 (송신자)
//!
//! N개의 TCP 연결을 받아 파일을 확장 블록 모드로 스트라이핑 전송
//!
//! 사용법:
//!   cargo run --release --bin xblock-server -- [OPTIONS]
//!
//! 예시:
//!   # 4개 연결로 파일 전송
//!   cargo run --release --bin xblock-server -- --bind 0.0.0.0:9000 --file data.bin -n 4
//!
//!   # 세그먼트 크기 지정
//!   cargo run --release --bin xblock-server -- -f data.bin --segment-size 262144

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use xblock::{Config, StripedWriter};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    file_path: Option<PathBuf>,
    connections: usize,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            file_path: None,
            connections: 4,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--connections" | "-n" => {
                if i + 1 < args.len() {
                    config.connections = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--segment-size" => {
                if i + 1 < args.len() {
                    config.config.max_segment_len = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--low-spec" => {
                config.config = Config::low_spec();
            }
            "--high-performance" => {
                config.config = Config::high_performance();
            }
            "--help" | "-h" => {
                println!(
                    r#"xblock Server - 확장 블록 모드 스트라이핑 송신자

N개의 TCP 연결로 파일 하나를 세그먼트 단위로 분산 전송
- 유휴 연결에 세그먼트를 넘겨 느린 연결에는 덜 배분
- 연결별 종료 마커로 완료 알림

사용법:
  cargo run --release --bin xblock-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:9000)
  -f, --file <PATH>         전송할 파일 경로 (없으면 1MB 테스트 데이터)
  -n, --connections <N>     연결 수 (기본: 4)
  --segment-size <SIZE>     세그먼트 최대 크기 바이트 (기본: 65536)
  --low-spec                저사양 설정
  --high-performance        고성능 설정
  -h, --help                이 도움말 출력

예시:
  # 파일 전송
  cargo run --release --bin xblock-server -- --file large_file.bin

  # 8개 연결 + 1MB 세그먼트
  cargo run --release --bin xblock-server -- -f data.bin -n 8 --segment-size 1048576
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// 읽은 바이트의 CRC32를 함께 계산하는 원본 래퍼
struct Crc32Reader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R> Crc32Reader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Crc32Reader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.hasher.update(&buf.filled()[before..]);
        }
        poll
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    server_config.config.validate()?;

    info!("xblock Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Connections: {}", server_config.connections);
    info!("Segment size: {} bytes", server_config.config.max_segment_len);

    // 전송할 데이터 준비
    let (source, source_len): (Box<dyn AsyncRead + Unpin + Send>, u64) =
        match &server_config.file_path {
            Some(path) => {
                let file = tokio::fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                info!("Loading file: {:?} ({} bytes)", path, len);
                (Box::new(file), len)
            }
            None => {
                // 테스트용 더미 데이터 (1MB)
                info!("Using test data (1MB)");
                let data = vec![0xABu8; 1024 * 1024];
                let len = data.len() as u64;
                (Box::new(io::Cursor::new(data)), len)
            }
        };
    info!(
        "Expected segments: {} data + 1 control + {} terminal",
        server_config.config.segments_for(source_len),
        server_config.connections
    );

    let listener = TcpListener::bind(server_config.bind_addr).await?;
    info!("Server listening on {}", server_config.bind_addr);
    info!("Waiting for {} connections...", server_config.connections);

    let mut connections = Vec::with_capacity(server_config.connections);
    while connections.len() < server_config.connections {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(
            "Connection {} accepted from {}",
            connections.len(),
            addr
        );
        connections.push(stream);
    }

    let mut writer = StripedWriter::new(connections, server_config.config.clone())?;
    let mut source = Crc32Reader::new(source);

    info!("Starting data transfer...");
    let start = Instant::now();

    let copied = writer.copy_from(&mut source).await;
    let stats = writer.finish().await?;
    let total = copied?;

    let elapsed = start.elapsed();
    let throughput = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1_000_000.0;

    info!("Transfer complete!");
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    info!("  Total bytes: {}", total);
    info!("  Throughput: {:.2} MB/s", throughput);
    info!("  CRC32: {:08x}", source.checksum());
    for (conn, ratio) in stats.connections.iter().zip(stats.connection_ratios()) {
        info!(
            "  Connection {}: {} segments, {} bytes ({:.1}%)",
            conn.conn_id,
            conn.segments,
            conn.bytes,
            ratio * 100.0
        );
    }

    Ok(())
}
