//! 에러 타입 정의

use std::io;

use thiserror::Error;

/// 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 헤더/페이로드 프레이밍 손상
    Framing,
    /// 프로토콜 위반 (중복 오프셋, EOD 카운트 충돌 등)
    Protocol,
    /// 연결 읽기/쓰기/종료 실패
    Transport,
    /// 전송 취소
    Cancellation,
    /// 잘못된 사용 (설정, 닫힌 writer 등)
    Usage,
}

/// xblock 에러 타입
///
/// 첫 번째 실패를 저장해 두었다가 이후 모든 호출에 돌려주기 위해 `Clone` 가능하다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("프레이밍 에러: 헤더 {expected}바이트 필요, {got}바이트 수신 후 스트림 종료")]
    Framing { expected: usize, got: usize },

    #[error("페이로드 절단: {expected}바이트 필요, {got}바이트 수신 후 스트림 종료")]
    TruncatedPayload { expected: u64, got: u64 },

    #[error("페이로드 크기 초과: {byte_count}바이트 (최대 {max})")]
    OversizedPayload { byte_count: u64, max: usize },

    #[error("중복 오프셋: {offset}")]
    DuplicateOffset { offset: u64 },

    #[error("EOD 카운트 충돌: 기존 {existing}, 수신 {got}")]
    ConflictingEodCount { existing: u32, got: u32 },

    #[error("EOD 카운트 불일치: 알림 {announced}, 연결 수 {connections}")]
    EodCountMismatch { announced: u32, connections: usize },

    #[error("유효하지 않은 EOD 카운트: {count}")]
    InvalidEodCount { count: u64 },

    #[error("세그먼트 범위 겹침: offset={offset}, 기존 세그먼트 offset={existing}")]
    OverlappingSegment { offset: u64, existing: u64 },

    #[error("커서보다 작은 오프셋: offset={offset}, cursor={cursor}")]
    OffsetBelowCursor { offset: u64, cursor: u64 },

    #[error("오프셋 공백: cursor={cursor}, 다음 세그먼트={next:?}")]
    Gap { cursor: u64, next: Option<u64> },

    #[error("제어 헤더에 페이로드 존재: byte_count={byte_count}")]
    UnexpectedPayload { byte_count: u64 },

    #[error("전송 에러 (연결 {conn_id}): {message}")]
    Transport {
        conn_id: usize,
        kind: io::ErrorKind,
        message: String,
    },

    #[error("원본 읽기 에러: {message}")]
    Source { kind: io::ErrorKind, message: String },

    #[error("전송 취소")]
    Cancelled,

    #[error("연결 없음")]
    NoConnections,

    #[error("이미 닫힌 writer")]
    WriterClosed,

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("버퍼 오버플로우: 최대 크기 {max_size} 초과")]
    BufferOverflow { max_size: usize },

    #[error("채널 에러")]
    ChannelError,
}

impl Error {
    /// 연결 I/O 에러를 전송 에러로 변환
    pub fn transport(conn_id: usize, err: io::Error) -> Self {
        Error::Transport {
            conn_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// 송신 원본 읽기 에러 변환
    pub fn source_io(err: io::Error) -> Self {
        Error::Source {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// 에러 분류
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Framing { .. }
            | Error::TruncatedPayload { .. }
            | Error::OversizedPayload { .. } => ErrorKind::Framing,
            Error::DuplicateOffset { .. }
            | Error::ConflictingEodCount { .. }
            | Error::EodCountMismatch { .. }
            | Error::InvalidEodCount { .. }
            | Error::OverlappingSegment { .. }
            | Error::OffsetBelowCursor { .. }
            | Error::Gap { .. }
            | Error::UnexpectedPayload { .. } => ErrorKind::Protocol,
            Error::Transport { .. } | Error::Source { .. } => ErrorKind::Transport,
            Error::Cancelled => ErrorKind::Cancellation,
            Error::NoConnections
            | Error::WriterClosed
            | Error::InvalidConfig(_)
            | Error::BufferOverflow { .. }
            | Error::ChannelError => ErrorKind::Usage,
        }
    }

    pub fn is_framing(&self) -> bool {
        self.kind() == ErrorKind::Framing
    }

    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Transport { kind, .. } | Error::Source { kind, .. } => *kind,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Framing { .. } | Error::TruncatedPayload { .. } => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
