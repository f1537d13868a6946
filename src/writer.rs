//! 스트라이핑 송신자
//!
//! - 연결당 워커 태스크 하나
//! - 무버퍼 인계 채널로 유휴 워커에게 세그먼트 배분
//! - 배리어로 종료 마커 전송 후 연결 종료

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordination::{barrier, Barrier, Cancellation, WorkerSignal};
use crate::handoff::{handoff, HandoffReceiver, HandoffSender};
use crate::header::Flags;
use crate::segment::Segment;
use crate::stats::TransferStats;
use crate::{Config, Error, Result};

/// 송신자 상태
enum WriterState<W> {
    /// 첫 쓰기 전
    Idle(Vec<W>),

    /// 워커 실행 중
    Running(Running<W>),

    /// finish 이후
    Closed,
}

struct Running<W> {
    handoff: HandoffSender,
    barrier: Barrier,
    workers: Vec<JoinHandle<W>>,
}

/// 워커와 공유하는 상태
struct WriterShared {
    /// 다음 세그먼트 오프셋 (공급자만 갱신)
    cursor: AtomicU64,

    /// 첫 번째 실패
    failure: Mutex<Option<Error>>,

    /// 전송 통계
    stats: Mutex<TransferStats>,

    /// 취소 신호
    cancel: Cancellation,
}

impl WriterShared {
    fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    fn failure(&self) -> Option<Error> {
        self.failure.lock().clone()
    }

    /// 실패 기록 (첫 번째만 유지) 후 전체 취소
    fn fail(&self, err: Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                warn!("전송 실패: {}", err);
                *failure = Some(err);
            }
        }
        self.cancel.cancel();
    }

    /// 실패 또는 취소 중 보고할 에러
    fn abort_reason(&self) -> Error {
        self.failure().unwrap_or(Error::Cancelled)
    }
}

/// 워커 루프 종료 사유
enum WorkerExit {
    Stopped,
    Failed(Error),
    Cancelled,
}

/// 스트라이핑 송신자
pub struct StripedWriter<W> {
    config: Config,
    connection_count: usize,
    state: WriterState<W>,
    shared: Arc<WriterShared>,
}

impl<W> StripedWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// 새 송신자 생성
    ///
    /// 워커는 첫 쓰기(또는 finish) 때 시작된다.
    pub fn new(connections: Vec<W>, config: Config) -> Result<Self> {
        config.validate()?;
        if connections.is_empty() {
            return Err(Error::NoConnections);
        }

        let connection_count = connections.len();
        let shared = Arc::new(WriterShared {
            cursor: AtomicU64::new(0),
            failure: Mutex::new(None),
            stats: Mutex::new(TransferStats::new(connection_count, config.stats_window_size)),
            cancel: Cancellation::new(),
        });

        Ok(Self {
            config,
            connection_count,
            state: WriterState::Idle(connections),
            shared,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count
    }

    /// 지금까지 인계된 바이트 수
    pub fn bytes_written(&self) -> u64 {
        self.shared.cursor()
    }

    /// 통계 복사
    pub fn stats(&self) -> TransferStats {
        self.shared.stats.lock().clone()
    }

    /// 취소 핸들
    pub fn cancellation(&self) -> Cancellation {
        self.shared.cancel.clone()
    }

    /// 전송 취소
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// 워커 시작 및 제어 세그먼트 전송
    async fn ensure_started(&mut self) -> Result<()> {
        let connections = match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Idle(connections) => connections,
            WriterState::Running(running) => {
                self.state = WriterState::Running(running);
                return Ok(());
            }
            WriterState::Closed => return Err(Error::WriterClosed),
        };

        let count = connections.len();
        let (handoff_tx, handoff_rx) = handoff(count);
        let (barrier, signals) = barrier(count);

        let workers = connections
            .into_iter()
            .zip(signals)
            .enumerate()
            .map(|(conn_id, (conn, signal))| {
                tokio::spawn(run_worker(
                    conn_id,
                    conn,
                    handoff_rx.clone(),
                    signal,
                    self.shared.clone(),
                ))
            })
            .collect();
        drop(handoff_rx);

        info!(
            "Striped writer started: {} connections, segment <= {} bytes",
            count, self.config.max_segment_len
        );

        self.state = WriterState::Running(Running {
            handoff: handoff_tx,
            barrier,
            workers,
        });

        self.feed(Segment::control(count as u64)).await
    }

    /// 유휴 워커에게 세그먼트 인계
    async fn feed(&mut self, segment: Segment) -> Result<()> {
        let shared = self.shared.clone();
        let running = match &mut self.state {
            WriterState::Running(running) => running,
            WriterState::Idle(_) | WriterState::Closed => return Err(Error::WriterClosed),
        };

        if shared.cancel.is_cancelled() {
            return Err(shared.abort_reason());
        }

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(shared.abort_reason()),
            sent = running.handoff.send(segment) => {
                // 모든 워커가 떠났다면 그 원인을 보고
                sent.map_err(|_| shared.failure().unwrap_or(Error::ChannelError))
            }
        }
    }

    /// 데이터 세그먼트 하나 전송
    async fn feed_data(&mut self, chunk: Bytes) -> Result<()> {
        let offset = self.shared.cursor();
        let len = chunk.len() as u64;

        self.feed(Segment::data(chunk, offset, Flags::NONE)).await?;
        self.shared.cursor.store(offset + len, Ordering::Release);
        Ok(())
    }

    /// 최대 세그먼트 길이만큼 전송하고 전송한 길이 반환
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ensure_started().await?;
        if buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min(self.config.max_segment_len);
        self.feed_data(Bytes::copy_from_slice(&buf[..len])).await?;
        Ok(len)
    }

    /// 버퍼 전체 전송
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.write_bytes(Bytes::copy_from_slice(buf)).await
    }

    /// 복사 없이 전송 (세그먼트 길이로 분할)
    pub async fn write_bytes(&mut self, mut data: Bytes) -> Result<()> {
        self.ensure_started().await?;

        while !data.is_empty() {
            let len = data.len().min(self.config.max_segment_len);
            let chunk = data.split_to(len);
            self.feed_data(chunk).await?;
        }
        Ok(())
    }

    /// 원본 스트림을 끝까지 읽어 전송
    pub async fn copy_from<R>(&mut self, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_started().await?;

        let segment_len = self.config.max_segment_len;
        let mut total = 0u64;

        loop {
            let mut buf = BytesMut::with_capacity(segment_len);
            let mut eof = false;

            // 한 세그먼트를 가능한 한 채움
            while buf.len() < segment_len {
                let remaining = segment_len - buf.len();
                let mut limited = (&mut buf).limit(remaining);
                let n = source
                    .read_buf(&mut limited)
                    .await
                    .map_err(Error::source_io)?;
                if n == 0 {
                    eof = true;
                    break;
                }
            }

            if !buf.is_empty() {
                total += buf.len() as u64;
                self.feed_data(buf.freeze()).await?;
            }

            if eof {
                return Ok(total);
            }
        }
    }

    /// 원본 전송 후 종료
    pub async fn send_from<R>(&mut self, mut source: R) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
    {
        let copied = self.copy_from(&mut source).await;
        if let Err(err) = &copied {
            self.shared.fail(err.clone());
        }

        let stats = self.finish().await?;
        copied?;
        Ok(stats)
    }

    /// 전송 종료
    ///
    /// 모든 워커가 종료 마커를 보낸 뒤 연결을 닫고, 실패가 있었으면 첫 번째 에러를 반환.
    pub async fn finish(&mut self) -> Result<TransferStats> {
        let started = self.ensure_started().await;

        let Running {
            handoff,
            barrier,
            workers,
        } = match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Running(running) => running,
            WriterState::Idle(_) | WriterState::Closed => return Err(Error::WriterClosed),
        };

        let acknowledged = barrier.stop().await;
        drop(handoff);

        for (conn_id, worker) in workers.into_iter().enumerate() {
            match worker.await {
                Ok(mut conn) => {
                    if let Err(e) = conn.shutdown().await {
                        if !self.shared.cancel.is_cancelled() {
                            self.shared.fail(Error::transport(conn_id, e));
                        }
                    }
                }
                Err(e) => {
                    self.shared.fail(Error::Transport {
                        conn_id,
                        kind: std::io::ErrorKind::Other,
                        message: format!("워커 비정상 종료: {}", e),
                    });
                }
            }
        }

        if self.shared.cancel.is_cancelled() {
            return Err(self.shared.abort_reason());
        }
        started?;
        if acknowledged < self.connection_count {
            return Err(Error::ChannelError);
        }

        let stats = self.stats();
        info!("Striped writer finished: {}", stats.summary());
        Ok(stats)
    }
}

impl<W> Drop for StripedWriter<W> {
    fn drop(&mut self) {
        if matches!(self.state, WriterState::Running(_)) {
            // finish 없이 drop되면 워커를 정리
            self.shared.cancel.cancel();
        }
    }
}

/// 세그먼트 하나 쓰기 (취소 시 중단)
async fn send_segment<W>(
    conn_id: usize,
    conn: &mut W,
    segment: &Segment,
    cancel: &Cancellation,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        written = segment.write_to(conn) => written.map_err(|e| Error::transport(conn_id, e)),
    }
}

/// 종료 마커 쓰기 후 flush
async fn send_terminal<W>(conn_id: usize, conn: &mut W, shared: &WriterShared) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let terminal = Segment::terminal(shared.cursor());
    send_segment(conn_id, conn, &terminal, &shared.cancel).await?;
    conn.flush()
        .await
        .map_err(|e| Error::transport(conn_id, e))
}

/// 세그먼트 쓰기 후 통계 기록
async fn deliver<W>(conn_id: usize, conn: &mut W, segment: &Segment, shared: &WriterShared) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_segment(conn_id, conn, segment, &shared.cancel).await?;

    let mut stats = shared.stats.lock();
    if segment.is_control() {
        stats.record_control(conn_id);
        debug!("연결 {}: EOD 카운트 {} 전송", conn_id, segment.header.offset_count);
    } else {
        stats.record_segment(conn_id, segment.len());
    }
    Ok(())
}

/// 정지 후 마무리: 정지 직전에 인계된 세그먼트, 종료 마커 순서로 전송
async fn drain_and_terminate<W>(
    conn_id: usize,
    conn: &mut W,
    handoff: &mut HandoffReceiver,
    shared: &WriterShared,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(segment) = handoff.take_pending() {
        debug!("연결 {}: 정지 직전 인계된 세그먼트 전송 (offset={})", conn_id, segment.offset());
        deliver(conn_id, conn, &segment, shared).await?;
    }
    send_terminal(conn_id, conn, shared).await
}

/// 연결 워커 루프
async fn run_worker<W>(
    conn_id: usize,
    mut conn: W,
    mut handoff: HandoffReceiver,
    mut signal: WorkerSignal,
    shared: Arc<WriterShared>,
) -> W
where
    W: AsyncWrite + Unpin,
{
    debug!("writer 워커 {} 시작", conn_id);

    let exit = loop {
        tokio::select! {
            biased;
            segment = handoff.recv() => {
                let Some(segment) = segment else {
                    break WorkerExit::Cancelled;
                };

                match deliver(conn_id, &mut conn, &segment, &shared).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => break WorkerExit::Cancelled,
                    Err(err) => break WorkerExit::Failed(err),
                }
            }
            stop = signal.should_stop() => {
                break if stop { WorkerExit::Stopped } else { WorkerExit::Cancelled };
            }
            _ = shared.cancel.cancelled() => break WorkerExit::Cancelled,
        }
    };

    match exit {
        WorkerExit::Stopped => {
            match drain_and_terminate(conn_id, &mut conn, &mut handoff, &shared).await {
                Ok(()) => {
                    shared.stats.lock().record_terminal(conn_id);
                    debug!("연결 {}: 종료 마커 전송", conn_id);
                }
                Err(Error::Cancelled) => debug!("연결 {}: 종료 마커 전송 중 취소", conn_id),
                Err(err) => shared.fail(err),
            }
        }
        WorkerExit::Failed(err) => shared.fail(err),
        WorkerExit::Cancelled => debug!("writer 워커 {} 취소", conn_id),
    }

    // 핸드오프 슬롯을 더 이상 올리지 않음
    drop(handoff);

    signal.done();
    conn
}
