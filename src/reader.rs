//! 스트라이핑 수신자
//!
//! 연결별 워커가 세그먼트를 디코딩해 공유 전송 상태에 반영하고,
//! `read`는 커서 위치의 세그먼트가 도착할 때까지 `Notify`로 대기한다.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::coordination::Cancellation;
use crate::header::Flags;
use crate::segment::Segment;
use crate::stats::TransferStats;
use crate::transmission::{Delivery, Transmission};
use crate::{Config, Error, Result};

/// 페이로드 반영 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// 재조립 큐 + 순차 읽기
    Stream,
    /// 수집 버퍼에 직접 배치
    Collect,
}

/// 워커와 공유하는 상태
struct ReaderShared {
    /// 전송 상태 (단일 변경 지점)
    state: Mutex<Transmission>,

    /// 상태 변경 알림
    notify: Notify,

    /// 첫 번째 실패
    failure: Mutex<Option<Error>>,

    cancel: Cancellation,

    stats: Mutex<TransferStats>,

    /// 연결 수
    connections: usize,

    /// 실행 중인 워커 수
    live_workers: AtomicUsize,

    /// 허용 최대 페이로드
    max_payload_len: usize,
}

impl ReaderShared {
    fn failure(&self) -> Option<Error> {
        self.failure.lock().clone()
    }

    fn fail(&self, err: Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                warn!("수신 실패: {}", err);
                *failure = Some(err);
            }
        }
        self.cancel.cancel();
        self.notify.notify_one();
    }

    fn abort_reason(&self) -> Error {
        self.failure().unwrap_or(Error::Cancelled)
    }

    /// 디코딩된 세그먼트를 전송 상태에 반영
    ///
    /// 종료 마커를 받으면 false (워커 루프 종료).
    fn accept(&self, conn_id: usize, segment: Segment, mode: Mode) -> Result<bool> {
        let header = segment.header;
        let mut state = self.state.lock();

        if header.is_eod_count() {
            if header.byte_count != 0 {
                return Err(Error::UnexpectedPayload {
                    byte_count: header.byte_count,
                });
            }

            let total = u32::try_from(header.offset_count).map_err(|_| Error::InvalidEodCount {
                count: header.offset_count,
            })?;
            state.set_eod_total(total)?;
            if total as usize != self.connections {
                return Err(Error::EodCountMismatch {
                    announced: total,
                    connections: self.connections,
                });
            }

            self.stats.lock().record_control(conn_id);
            debug!("연결 {}: EOD 카운트 {} 수신", conn_id, total);

            // 제어 헤더가 종료 마커를 겸할 수 있음
            let terminal = header.is_end_of_data();
            if terminal {
                state.ack_eod(conn_id);
                self.stats.lock().record_terminal(conn_id);
                debug!("연결 {}: 제어 헤더로 종료", conn_id);
            }
            drop(state);
            self.notify.notify_one();
            return Ok(!terminal);
        }

        if header.contains(Flags::SENDER_CLOSES_CONNECTION) {
            debug!("연결 {}: 송신자가 연결 종료 예정", conn_id);
        }

        let terminal = segment.is_terminal();
        if !segment.is_empty() {
            self.stats.lock().record_segment(conn_id, segment.len());
            match mode {
                Mode::Stream => state.push(segment)?,
                Mode::Collect => state.place(segment.offset(), &segment.data)?,
            }
        }

        if terminal {
            state.ack_eod(conn_id);
            self.stats.lock().record_terminal(conn_id);
            debug!(
                "연결 {}: 종료 마커 수신 ({}/{:?})",
                conn_id,
                state.eod_ack_count(),
                state.eod_total()
            );
        }

        drop(state);
        self.notify.notify_one();
        Ok(!terminal)
    }
}

/// 스트라이핑 수신자
pub struct StripedReader<R> {
    config: Config,
    pending: Option<Vec<R>>,
    mode: Option<Mode>,
    delivered: u64,
    shared: Arc<ReaderShared>,
}

impl<R> StripedReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// 새 수신자 생성
    ///
    /// 워커는 첫 읽기 때 시작된다.
    pub fn new(connections: Vec<R>, config: Config) -> Result<Self> {
        config.validate()?;
        if connections.is_empty() {
            return Err(Error::NoConnections);
        }

        let count = connections.len();
        let shared = Arc::new(ReaderShared {
            state: Mutex::new(Transmission::new()),
            notify: Notify::new(),
            failure: Mutex::new(None),
            cancel: Cancellation::new(),
            stats: Mutex::new(TransferStats::new(count, config.stats_window_size)),
            connections: count,
            live_workers: AtomicUsize::new(0),
            max_payload_len: config.max_payload_len,
        });

        Ok(Self {
            config,
            pending: Some(connections),
            mode: None,
            delivered: 0,
            shared,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections
    }

    /// 호출자에게 전달된 바이트 수
    pub fn bytes_read(&self) -> u64 {
        self.delivered
    }

    /// 모든 종료 마커 수신 여부
    pub fn completed(&self) -> bool {
        self.shared.state.lock().completed()
    }

    pub fn stats(&self) -> TransferStats {
        self.shared.stats.lock().clone()
    }

    pub fn cancellation(&self) -> Cancellation {
        self.shared.cancel.clone()
    }

    /// 수신 취소
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        self.shared.notify.notify_one();
    }

    /// 워커 시작 (한 번만)
    fn start(&mut self, mode: Mode) {
        let Some(connections) = self.pending.take() else {
            return;
        };

        self.mode = Some(mode);
        if mode == Mode::Collect {
            *self.shared.state.lock() =
                Transmission::with_capacity(self.config.initial_buffer_capacity);
        }

        self.shared
            .live_workers
            .store(connections.len(), Ordering::Release);
        for (conn_id, conn) in connections.into_iter().enumerate() {
            tokio::spawn(run_worker(conn_id, conn, mode, self.shared.clone()));
        }

        info!(
            "Striped reader started: {} connections ({:?})",
            self.shared.connections, mode
        );
    }

    /// 커서 위치에서 최대 max바이트, 스트림 끝이면 None
    async fn next_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        self.start(Mode::Stream);

        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(self.shared.abort_reason());
            }

            // 상태를 보기 전에 읽어야 워커 종료 후의 최종 상태가 보장됨
            let live = self.shared.live_workers.load(Ordering::Acquire);
            let delivery = {
                let mut state = self.shared.state.lock();
                match state.next_delivery(max) {
                    Ok(Delivery::Pending) if live == 0 => Err(Error::Gap {
                        cursor: state.cursor(),
                        next: state.queue().peek_min().map(Segment::offset),
                    }),
                    other => other,
                }
            };

            match delivery {
                Ok(Delivery::Ready(chunk)) => {
                    self.delivered += chunk.len() as u64;
                    return Ok(Some(chunk));
                }
                Ok(Delivery::Finished) => return Ok(None),
                Ok(Delivery::Pending) => {
                    tokio::select! {
                        _ = self.shared.notify.notified() => {}
                        _ = self.shared.cancel.cancelled() => {}
                    }
                }
                Err(err) => {
                    self.shared.fail(err);
                    return Err(self.shared.abort_reason());
                }
            }
        }
    }

    /// 순차 읽기, 스트림 끝이면 0
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        match self.next_chunk(buf.len()).await? {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    /// 스트림 끝까지 읽어 out에 추가
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut total = 0;
        while let Some(chunk) = self.next_chunk(usize::MAX).await? {
            out.extend_from_slice(&chunk);
            total += chunk.len();
        }

        info!("Striped reader finished: {}", self.stats().summary());
        Ok(total)
    }

    /// 전체 메시지 수집
    ///
    /// 페이로드를 수집 버퍼에 직접 배치하고 모든 종료 마커 수신 후 반환.
    /// 이미 스트리밍 읽기를 시작했다면 남은 스트림을 읽어 반환한다.
    pub async fn into_message(mut self) -> Result<Bytes> {
        if self.mode == Some(Mode::Stream) {
            let mut out = Vec::new();
            self.read_to_end(&mut out).await?;
            return Ok(Bytes::from(out));
        }

        self.start(Mode::Collect);

        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(self.shared.abort_reason());
            }

            let live = self.shared.live_workers.load(Ordering::Acquire);
            {
                let state = self.shared.state.lock();
                if state.completed() {
                    break;
                }
                if live == 0 {
                    let err = Error::Gap {
                        cursor: state.written_len(),
                        next: None,
                    };
                    drop(state);
                    self.shared.fail(err);
                    return Err(self.shared.abort_reason());
                }
            }

            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = self.shared.cancel.cancelled() => {}
            }
        }

        let state = std::mem::take(&mut *self.shared.state.lock());
        let message = state.into_message()?;
        self.delivered = message.len() as u64;

        info!(
            "Striped reader collected {} bytes: {}",
            message.len(),
            self.stats().summary()
        );
        Ok(message)
    }
}

impl<R> Drop for StripedReader<R> {
    fn drop(&mut self) {
        // 남은 워커 정리 (완료 후에는 영향 없음)
        self.shared.cancel.cancel();
    }
}

/// 연결 워커 루프
async fn run_worker<R>(conn_id: usize, mut conn: R, mode: Mode, shared: Arc<ReaderShared>)
where
    R: AsyncRead + Unpin,
{
    debug!("reader 워커 {} 시작", conn_id);

    loop {
        let segment = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                debug!("reader 워커 {} 취소", conn_id);
                break;
            }
            segment = Segment::read_from(&mut conn, conn_id, shared.max_payload_len) => segment,
        };

        match segment.and_then(|segment| shared.accept(conn_id, segment, mode)) {
            Ok(true) => {}
            Ok(false) => {
                debug!("reader 워커 {} 종료", conn_id);
                break;
            }
            Err(err) => {
                shared.fail(err);
                break;
            }
        }
    }

    drop(conn);
    shared.live_workers.fetch_sub(1, Ordering::AcqRel);
    shared.notify.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn data(offset: u64, bytes: &[u8]) -> Segment {
        Segment::data(Bytes::copy_from_slice(bytes), offset, Flags::NONE)
    }

    async fn feed(conn: &mut DuplexStream, segments: &[Segment]) {
        for segment in segments {
            segment.write_to(conn).await.unwrap();
        }
    }

    fn pipes(n: usize) -> (Vec<DuplexStream>, Vec<DuplexStream>) {
        (0..n).map(|_| tokio::io::duplex(4096)).unzip()
    }

    /// N=3, L=4, B=0..16 을 연결별로 뒤섞어 전송 (제어 헤더는 연결 2)
    async fn scrambled_transfer() -> (Vec<DuplexStream>, Vec<u8>) {
        let payload: Vec<u8> = (0..16).collect();
        let (local, mut remote) = pipes(3);

        feed(
            &mut remote[0],
            &[data(8, &payload[8..12]), data(0, &payload[0..4]), Segment::terminal(16)],
        )
        .await;
        feed(&mut remote[1], &[data(12, &payload[12..16]), Segment::terminal(16)]).await;
        feed(
            &mut remote[2],
            &[Segment::control(3), data(4, &payload[4..8]), Segment::terminal(16)],
        )
        .await;

        // local은 reader가, remote는 호출자가 보관
        drop(remote);
        (local, payload)
    }

    #[tokio::test]
    async fn test_reassembles_out_of_order_connections() {
        let (local, payload) = scrambled_transfer().await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).await.unwrap(), 16);
        assert_eq!(out, payload);
        assert!(reader.completed());

        // 스트림 끝 이후에도 0
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);

        let stats = reader.stats();
        assert_eq!(stats.total_segments, 4);
        assert_eq!(stats.control_segments(), 1);
        assert_eq!(stats.connections[2].control_segments, 1);
        assert_eq!(stats.terminated_connections(), 3);
    }

    #[tokio::test]
    async fn test_partial_reads_with_tiny_buffer() {
        let (local, payload) = scrambled_transfer().await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 3);
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
        assert_eq!(reader.bytes_read(), 16);
    }

    #[tokio::test]
    async fn test_into_message_matches_stream() {
        let (local, payload) = scrambled_transfer().await;

        let reader = StripedReader::new(local, Config::default()).unwrap();
        let message = reader.into_message().await.unwrap();
        assert_eq!(&message[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_empty_transfer() {
        let (local, mut remote) = pipes(2);
        feed(&mut remote[0], &[Segment::terminal(0)]).await;
        feed(&mut remote[1], &[Segment::control(2), Segment::terminal(0)]).await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_framing_error_fails_whole_transfer() {
        let (local, mut remote) = pipes(2);

        feed(&mut remote[0], &[Segment::control(2), data(0, b"abcd")]).await;
        // 헤더 중간에서 끊김
        remote[0].write_all(&[0u8; 5]).await.unwrap();
        let mut truncated = remote.remove(0);
        truncated.shutdown().await.unwrap();
        drop(truncated);

        // 나머지 연결은 열린 채 데이터 없음
        let mut idle = remote.remove(0);
        feed(&mut idle, &[data(4, b"efgh")]).await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(err.is_framing(), "unexpected: {err:?}");
        assert_eq!(err, Error::Framing { expected: 17, got: 5 });

        // 다른 연결도 닫힘
        let mut buf = [0u8; 1];
        let closed = tokio::time::timeout(Duration::from_secs(1), idle.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed, 0);

        // 이후 호출도 같은 에러
        assert_eq!(reader.read(&mut buf).await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn test_conflicting_eod_count() {
        let (local, mut remote) = pipes(2);
        feed(&mut remote[0], &[Segment::control(2), Segment::control(3)]).await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err, Error::ConflictingEodCount { existing: 2, got: 3 });
        drop(remote);
    }

    #[tokio::test]
    async fn test_eod_count_must_match_connections() {
        let (local, mut remote) = pipes(2);
        feed(&mut remote[0], &[Segment::control(5)]).await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(
            err,
            Error::EodCountMismatch {
                announced: 5,
                connections: 2
            }
        );
        drop(remote);
    }

    #[tokio::test]
    async fn test_control_with_payload_is_rejected() {
        let (local, mut remote) = pipes(1);
        let bogus = Segment::with_header(
            crate::header::Header::new(4, 1, Flags::END_OF_DATA_COUNT),
            Bytes::new(),
        );
        feed(&mut remote[0], &[bogus]).await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err, Error::UnexpectedPayload { byte_count: 4 });
        drop(remote);
    }

    #[tokio::test]
    async fn test_missing_range_is_gap() {
        let (local, mut remote) = pipes(1);
        feed(
            &mut remote[0],
            &[Segment::control(1), data(4, b"efgh"), Segment::terminal(8)],
        )
        .await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err, Error::Gap { cursor: 0, next: Some(4) });
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_into_message_detects_gap() {
        let (local, mut remote) = pipes(1);
        feed(
            &mut remote[0],
            &[Segment::control(1), data(4, b"efgh"), Segment::terminal(8)],
        )
        .await;

        let reader = StripedReader::new(local, Config::default()).unwrap();
        let err = reader.into_message().await.unwrap_err();
        assert!(matches!(err, Error::Gap { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_offset_is_protocol_error() {
        let (local, mut remote) = pipes(2);
        feed(&mut remote[0], &[Segment::control(2), data(4, b"efgh")]).await;
        feed(&mut remote[1], &[data(4, b"efgh")]).await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err, Error::DuplicateOffset { offset: 4 });
        drop(remote);
    }

    #[tokio::test]
    async fn test_control_header_can_close_connection() {
        let (local, mut remote) = pipes(1);
        let closing = Segment::with_header(
            crate::header::Header::new(0, 1, Flags::END_OF_DATA_COUNT | Flags::END_OF_DATA),
            Bytes::new(),
        );
        feed(&mut remote[0], &[closing]).await;

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(1), reader.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(reader.completed());
        assert_eq!(reader.stats().terminated_connections(), 1);
        drop(remote);
    }

    #[tokio::test]
    async fn test_into_message_rejects_duplicate_segment() {
        let (local, mut remote) = pipes(2);
        feed(
            &mut remote[0],
            &[Segment::control(2), data(0, b"abcd"), Segment::terminal(4)],
        )
        .await;
        feed(&mut remote[1], &[data(0, b"abcd"), Segment::terminal(4)]).await;

        let reader = StripedReader::new(local, Config::default()).unwrap();
        let err = reader.into_message().await.unwrap_err();
        assert_eq!(err, Error::DuplicateOffset { offset: 0 });
        drop(remote);
    }

    #[tokio::test]
    async fn test_into_message_rejects_overlap_with_hole() {
        let (local, mut remote) = pipes(2);
        feed(
            &mut remote[0],
            &[Segment::control(2), data(0, b"AAAA"), Segment::terminal(6)],
        )
        .await;
        feed(&mut remote[1], &[data(2, b"BBBB"), Segment::terminal(6)]).await;

        let reader = StripedReader::new(local, Config::default()).unwrap();
        let err = reader.into_message().await.unwrap_err();
        assert!(err.is_protocol(), "unexpected: {err:?}");
        assert!(matches!(err, Error::OverlappingSegment { .. }));
        drop(remote);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_read() {
        let (local, remote) = pipes(2);

        let mut reader = StripedReader::new(local, Config::default()).unwrap();
        let cancel = reader.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap_err(), Error::Cancelled);
        drop(remote);
    }
}
