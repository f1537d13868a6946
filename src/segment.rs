//! 세그먼트 정의
//!
//! - 데이터 세그먼트: 스트림 내 절대 오프셋 + 페이로드
//! - 제어 세그먼트: 전체 연결 수 알림 (EOD 카운트)
//! - 종료 세그먼트: 연결별 종료 마커

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::header::{read_header, Flags, Header};
use crate::{Error, Result};

/// 세그먼트 (헤더 + 페이로드)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 헤더
    pub header: Header,

    /// 페이로드
    pub data: Bytes,
}

impl Segment {
    /// 데이터 세그먼트 생성
    pub fn data(payload: Bytes, offset: u64, flags: Flags) -> Self {
        Self {
            header: Header::new(payload.len() as u64, offset, flags),
            data: payload,
        }
    }

    /// 제어 세그먼트 생성 (EOD 카운트 = 연결 수)
    pub fn control(connections: u64) -> Self {
        Self {
            header: Header::eod_count(connections),
            data: Bytes::new(),
        }
    }

    /// 종료 세그먼트 생성
    ///
    /// offset은 송신자의 현재 쓰기 커서 (수신측은 사용하지 않음)
    pub fn terminal(cursor: u64) -> Self {
        Self {
            header: Header::new(0, cursor, Flags::END_OF_DATA),
            data: Bytes::new(),
        }
    }

    pub fn with_header(header: Header, data: Bytes) -> Self {
        Self { header, data }
    }

    /// 스트림 내 오프셋 (정렬 키)
    pub fn offset(&self) -> u64 {
        self.header.offset_count
    }

    /// 페이로드 길이
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 페이로드 끝 오프셋 (exclusive)
    pub fn end(&self) -> u64 {
        self.offset() + self.data.len() as u64
    }

    pub fn is_control(&self) -> bool {
        self.header.is_eod_count()
    }

    pub fn is_terminal(&self) -> bool {
        self.header.is_end_of_data()
    }

    /// 앞쪽 n바이트를 잘라 새 세그먼트로 반환
    ///
    /// 남은 부분은 오프셋이 n만큼 전진한다.
    pub fn split_front(&mut self, n: usize) -> Segment {
        let n = n.min(self.data.len());
        let front = self.data.split_to(n);
        let offset = self.offset();

        self.header.offset_count += n as u64;
        self.header.byte_count = self.data.len() as u64;

        Segment::data(front, offset, Flags::NONE)
    }

    /// 연결에 헤더 + 페이로드 쓰기
    pub async fn write_to<W>(&self, conn: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        conn.write_all(&self.header.encode()).await?;
        if self.header.has_payload() {
            conn.write_all(&self.data).await?;
        }
        Ok(())
    }

    /// 연결에서 세그먼트 하나 읽기
    ///
    /// 부분 읽기를 반복해 byte_count만큼 채운다.
    pub async fn read_from<R>(conn: &mut R, conn_id: usize, max_payload: usize) -> Result<Segment>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_header(conn, conn_id).await?;
        if !header.has_payload() {
            return Ok(Segment::with_header(header, Bytes::new()));
        }

        if header.byte_count > max_payload as u64 {
            return Err(Error::OversizedPayload {
                byte_count: header.byte_count,
                max: max_payload,
            });
        }

        let expected = header.byte_count as usize;
        let mut data = vec![0u8; expected];
        let mut filled = 0;

        while filled < expected {
            let n = conn
                .read(&mut data[filled..])
                .await
                .map_err(|e| Error::transport(conn_id, e))?;
            if n == 0 {
                return Err(Error::TruncatedPayload {
                    expected: header.byte_count,
                    got: filled as u64,
                });
            }
            filled += n;
        }

        Ok(Segment::with_header(header, Bytes::from(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_LEN;

    #[test]
    fn test_factories() {
        let seg = Segment::data(Bytes::from_static(b"abcd"), 8, Flags::NONE);
        assert_eq!(seg.header.byte_count, 4);
        assert_eq!(seg.offset(), 8);
        assert_eq!(seg.end(), 12);
        assert!(!seg.is_control());
        assert!(!seg.is_terminal());

        let control = Segment::control(3);
        assert!(control.is_control());
        assert_eq!(control.header.offset_count, 3);
        assert!(control.is_empty());

        let terminal = Segment::terminal(16);
        assert!(terminal.is_terminal());
        assert_eq!(terminal.header.byte_count, 0);
        assert_eq!(terminal.offset(), 16);
    }

    #[test]
    fn test_split_front() {
        let mut seg = Segment::data(Bytes::from_static(b"hello world"), 100, Flags::NONE);
        let front = seg.split_front(5);

        assert_eq!(front.data.as_ref(), b"hello");
        assert_eq!(front.offset(), 100);
        assert_eq!(seg.data.as_ref(), b" world");
        assert_eq!(seg.offset(), 105);
        assert_eq!(seg.header.byte_count, 6);
    }

    #[tokio::test]
    async fn test_wire_round_trip_sequence() {
        let segments = vec![
            Segment::control(2),
            Segment::data(Bytes::from_static(b"0123"), 0, Flags::NONE),
            Segment::data(Bytes::from_static(b"xy"), 4, Flags::END_OF_DATA),
            Segment::terminal(6),
        ];

        let mut wire = Vec::new();
        for seg in &segments {
            seg.write_to(&mut wire).await.unwrap();
        }
        assert_eq!(wire.len(), 4 * HEADER_LEN + 6);

        let mut conn: &[u8] = &wire;
        for expected in &segments {
            let got = Segment::read_from(&mut conn, 0, 1024).await.unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut wire = Vec::new();
        Segment::data(Bytes::from_static(b"abcdef"), 0, Flags::NONE)
            .write_to(&mut wire)
            .await
            .unwrap();
        wire.truncate(HEADER_LEN + 2);

        let mut conn: &[u8] = &wire;
        let err = Segment::read_from(&mut conn, 0, 1024).await.unwrap_err();
        assert_eq!(err, Error::TruncatedPayload { expected: 6, got: 2 });
        assert!(err.is_framing());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let header = Header::new(1 << 40, 0, Flags::NONE);
        let bytes = header.encode();
        let mut conn: &[u8] = &bytes;

        let err = Segment::read_from(&mut conn, 0, 1024).await.unwrap_err();
        assert!(matches!(err, Error::OversizedPayload { max: 1024, .. }));
    }

    #[tokio::test]
    async fn test_control_header_skips_payload() {
        // 제어 헤더의 byte_count는 페이로드로 취급하지 않음
        let mut wire = Header::new(5, 3, Flags::END_OF_DATA_COUNT).encode().to_vec();
        wire.extend_from_slice(&Segment::terminal(0).header.encode());

        let mut conn: &[u8] = &wire;
        let control = Segment::read_from(&mut conn, 0, 1024).await.unwrap();
        assert!(control.is_control());
        assert_eq!(control.header.byte_count, 5);
        let terminal = Segment::read_from(&mut conn, 0, 1024).await.unwrap();
        assert!(terminal.is_terminal());
    }
}
