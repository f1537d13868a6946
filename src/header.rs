//! 확장 블록 헤더 정의
//!
//! 모든 연결에서 반복되는 고정 17바이트 헤더 (빅엔디언)
//!
//! ```text
//! +-------+------------------+-------------------+
//! | flags | byte_count (u64) | offset_count (u64)|
//! +-------+------------------+-------------------+
//!  1 byte       8 bytes             8 bytes
//! ```

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

/// 헤더 길이 (바이트)
pub const HEADER_LEN: usize = 17;

/// 헤더 플래그 비트마스크
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);

    /// 레거시 호환용, 동작 없음
    pub const END_OF_RECORD: Flags = Flags(128);

    /// 제어 헤더: offset_count가 전체 연결 수 N
    pub const END_OF_DATA_COUNT: Flags = Flags(64);

    /// 호환용, 동작 없음
    pub const SUSPECT_ERRORS: Flags = Flags(32);

    /// 레거시 호환용, 동작 없음
    pub const RESTART_MARKER: Flags = Flags(16);

    /// 이 연결의 종료 마커
    pub const END_OF_DATA: Flags = Flags(8);

    /// 이 헤더 뒤에 송신자가 연결을 닫음 (힌트)
    pub const SENDER_CLOSES_CONNECTION: Flags = Flags(4);

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::END_OF_RECORD, "END_OF_RECORD"),
            (Flags::END_OF_DATA_COUNT, "END_OF_DATA_COUNT"),
            (Flags::SUSPECT_ERRORS, "SUSPECT_ERRORS"),
            (Flags::RESTART_MARKER, "RESTART_MARKER"),
            (Flags::END_OF_DATA, "END_OF_DATA"),
            (Flags::SENDER_CLOSES_CONNECTION, "SENDER_CLOSES_CONNECTION"),
        ];

        if self.is_empty() {
            return write!(f, "Flags(NONE)");
        }

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        let unknown = self.0 & !NAMES.iter().fold(0, |acc, (flag, _)| acc | flag.0);
        if unknown != 0 {
            write!(f, "Flags({} | {:#04x})", names.join(" | "), unknown)
        } else {
            write!(f, "Flags({})", names.join(" | "))
        }
    }
}

/// 블록 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// 플래그
    pub flags: Flags,

    /// 뒤따르는 페이로드 길이
    pub byte_count: u64,

    /// 스트림 내 절대 오프셋 (제어 헤더면 연결 수)
    pub offset_count: u64,
}

impl Header {
    pub fn new(byte_count: u64, offset_count: u64, flags: Flags) -> Self {
        Self {
            flags,
            byte_count,
            offset_count,
        }
    }

    /// EOD 카운트 제어 헤더
    pub fn eod_count(count: u64) -> Self {
        Self::new(0, count, Flags::END_OF_DATA_COUNT)
    }

    pub fn contains(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_eod_count(&self) -> bool {
        self.contains(Flags::END_OF_DATA_COUNT)
    }

    pub fn is_end_of_data(&self) -> bool {
        self.contains(Flags::END_OF_DATA)
    }

    /// 페이로드가 뒤따르는지 여부
    pub fn has_payload(&self) -> bool {
        !self.is_eod_count() && self.byte_count > 0
    }

    /// 17바이트로 인코딩
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        self.encode_into(&mut &mut buf[..]);
        buf
    }

    /// 버퍼에 이어 쓰기
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.flags.bits());
        buf.put_u64(self.byte_count);
        buf.put_u64(self.offset_count);
    }

    /// 바이트에서 디코딩
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Framing {
                expected: HEADER_LEN,
                got: bytes.len(),
            });
        }

        let flags = Flags::from_bits(bytes.get_u8());
        let byte_count = bytes.get_u64();
        let offset_count = bytes.get_u64();

        Ok(Self {
            flags,
            byte_count,
            offset_count,
        })
    }
}

/// 연결에서 헤더 하나 읽기
///
/// 17바이트가 모이기 전에 스트림이 끝나면 `Error::Framing`.
pub async fn read_header<R>(conn: &mut R, conn_id: usize) -> Result<Header>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;

    while filled < HEADER_LEN {
        let n = conn
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::transport(conn_id, e))?;
        if n == 0 {
            return Err(Error::Framing {
                expected: HEADER_LEN,
                got: filled,
            });
        }
        filled += n;
    }

    Header::decode(&buf)
}
