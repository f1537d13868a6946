//! # xblock
//!
//! N개 연결 위에서 동작하는 확장 블록 모드 스트라이핑 전송
//!
//! ## 핵심 특징
//! - **고정 헤더**: 17바이트 big-endian 블록 헤더 (flags, byte_count, offset_count)
//! - **무버퍼 인계**: 유휴 연결에 세그먼트를 넘겨 느린 연결에는 덜 배분
//! - **순서 재조립**: 최소 오프셋 큐로 도착 순서와 무관하게 원래 순서 복원
//! - **종료 조율**: EOD 카운트 + 연결별 종료 마커로 완료 판정
//! - **전체 실패**: 한 연결의 프레이밍/전송 에러는 전송 전체를 중단

pub mod config;
pub mod coordination;
pub mod error;
pub mod handoff;
pub mod header;
pub mod queue;
pub mod reader;
pub mod segment;
pub mod socket;
pub mod stats;
pub mod transmission;
pub mod writer;

pub use config::Config;
pub use coordination::Cancellation;
pub use error::{Error, ErrorKind, Result};
pub use header::{Flags, Header, HEADER_LEN};
pub use reader::StripedReader;
pub use segment::Segment;
pub use socket::{open_striped, Connection, StreamReader, StreamWriter, StripedSocket};
pub use stats::TransferStats;
pub use writer::StripedWriter;

/// 기본 세그먼트 최대 길이 (바이트)
pub const DEFAULT_SEGMENT_LEN: usize = 64 * 1024; // 64KB

/// 기본 수신 페이로드 상한 (바이트)
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024; // 16MB
