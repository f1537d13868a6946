//! xblock 클라이언트 (수신자)
//!
//! 서버에 N개의 TCP 연결을 열고 스트라이핑된 데이터를 순서대로 재조립
//!
//! 사용법:
//!   cargo run --release --bin xblock-client -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin xblock-client -- --server 127.0.0.1:9000 --output received.bin
//!
//!   # 연결 수 지정 (서버와 같아야 함)
//!   cargo run --release --bin xblock-client -- -s 127.0.0.1:9000 -n 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use xblock::{Config, StripedReader};

/// 클라이언트 설정
struct ClientConfig {
    server_addr: SocketAddr,
    output_path: Option<PathBuf>,
    connections: usize,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            output_path: None,
            connections: 4,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--connections" | "-n" => {
                if i + 1 < args.len() {
                    config.connections = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--max-payload" => {
                if i + 1 < args.len() {
                    config.config.max_payload_len = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--low-spec" => {
                config.config = Config::low_spec();
            }
            "--help" | "-h" => {
                println!(
                    r#"xblock Client - 확장 블록 모드 스트라이핑 수신자

서버에 N개의 TCP 연결을 열고 세그먼트를 오프셋 순서로 재조립
- 도착 순서와 무관하게 원래 순서 복원
- 한 연결이라도 손상되면 전송 전체 실패

사용법:
  cargo run --release --bin xblock-client -- [OPTIONS]

옵션:
  -s, --server <ADDR>       서버 주소 (기본: 127.0.0.1:9000)
  -n, --connections <N>     연결 수 (기본: 4, 서버와 같아야 함)
  -o, --output <PATH>       수신 데이터 저장 경로
  --max-payload <SIZE>      허용 최대 페이로드 바이트 (기본: 16777216)
  --low-spec                저사양 설정
  -h, --help                이 도움말 출력

예시:
  # 서버에서 파일 수신
  cargo run --release --bin xblock-client -- --server 192.168.1.100:9000 --output received.bin
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();
    client_config.config.validate()?;

    info!("xblock Client starting...");
    info!("Server address: {}", client_config.server_addr);
    info!("Connections: {}", client_config.connections);

    let mut connections = Vec::with_capacity(client_config.connections);
    for conn_id in 0..client_config.connections {
        let stream = TcpStream::connect(client_config.server_addr).await?;
        stream.set_nodelay(true)?;
        info!("Connection {} established ({})", conn_id, stream.local_addr()?);
        connections.push(stream);
    }

    let mut reader = StripedReader::new(connections, client_config.config.clone())?;

    let mut output = match &client_config.output_path {
        Some(path) => Some(tokio::fs::File::create(path).await?),
        None => None,
    };

    info!("Starting data reception...");
    let start = Instant::now();

    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; client_config.config.max_segment_len];
    let mut total = 0u64;
    let mut next_report = 64 * 1024 * 1024;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
        if let Some(file) = output.as_mut() {
            file.write_all(&buf[..n]).await?;
        }

        total += n as u64;
        if total >= next_report {
            info!("Progress: {} MB received", total / (1024 * 1024));
            next_report += 64 * 1024 * 1024;
        }
    }

    if let Some(mut file) = output {
        file.flush().await?;
    }

    let elapsed = start.elapsed();
    let throughput = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1_000_000.0;
    let stats = reader.stats();

    info!("Transfer complete!");
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    info!("  Total bytes: {}", total);
    info!("  Segments received: {}", stats.total_segments);
    info!("  Throughput: {:.2} MB/s", throughput);
    info!("  CRC32: {:08x}", hasher.finalize());
    for conn in &stats.connections {
        info!(
            "  Connection {}: {} segments, {:.2} MB/s (window)",
            conn.conn_id,
            conn.segments,
            conn.throughput() / 1_000_000.0
        );
    }

    if let Some(path) = &client_config.output_path {
        info!("Data saved to {:?}", path);
    }

    Ok(())
}
