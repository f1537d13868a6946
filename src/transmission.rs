//! 수신측 전송 상태
//!
//! 재조립 큐, EOD 카운트/확인 집합, 메시지 수집 버퍼를 하나로 묶는다.
//! 항상 하나의 락 아래에서만 변경된다.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use bytes::{Bytes, BytesMut};

use crate::queue::ReassemblyQueue;
use crate::segment::Segment;
use crate::{Error, Result};

/// 수집 버퍼 최소 용량
pub const MIN_BUFFER_CAPACITY: usize = 2;

/// 다음 읽기 가능 상태
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// 커서 위치의 바이트
    Ready(Bytes),
    /// 다음 세그먼트 대기 중
    Pending,
    /// 스트림 끝
    Finished,
}

/// 전송 상태
#[derive(Debug)]
pub struct Transmission {
    /// 메시지 수집 버퍼 (len == capacity, 0으로 채움)
    buffer: BytesMut,

    /// 수집 버퍼 최고 기록 위치
    written_len: u64,

    /// 수집 버퍼에 배치된 범위 (시작 -> 끝)
    placed: BTreeMap<u64, u64>,

    /// EOD 카운트 (연결 수)
    eod_total: Option<u32>,

    /// 종료 마커를 보낸 연결 ID
    eod_acks: HashSet<usize>,

    /// 스트리밍용 재조립 큐
    queue: ReassemblyQueue,

    /// 스트리밍 읽기 커서
    cursor: u64,
}

impl Default for Transmission {
    fn default() -> Self {
        Self::new()
    }
}

impl Transmission {
    pub fn new() -> Self {
        Self::with_capacity(MIN_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buffer = BytesMut::new();
        buffer.resize(capacity.max(MIN_BUFFER_CAPACITY), 0);

        Self {
            buffer,
            written_len: 0,
            placed: BTreeMap::new(),
            eod_total: None,
            eod_acks: HashSet::new(),
            queue: ReassemblyQueue::new(),
            cursor: 0,
        }
    }

    /// 현재 버퍼 용량
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn written_len(&self) -> u64 {
        self.written_len
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn eod_total(&self) -> Option<u32> {
        self.eod_total
    }

    pub fn eod_ack_count(&self) -> usize {
        self.eod_acks.len()
    }

    pub fn queue(&self) -> &ReassemblyQueue {
        &self.queue
    }

    /// offset+len이 들어가도록 용량 확보
    ///
    /// max(offset+len, 2×capacity)로 늘리고 줄이지 않는다.
    pub fn ensure_capacity(&mut self, offset: u64, len: usize) -> Result<()> {
        let required = offset
            .checked_add(len as u64)
            .and_then(|end| usize::try_from(end).ok())
            .ok_or(Error::BufferOverflow { max_size: usize::MAX })?;

        let capacity = self.buffer.len();
        if required > capacity {
            let grown = required.max(capacity.saturating_mul(2));
            self.buffer.resize(grown, 0);
        }
        Ok(())
    }

    /// 수집 버퍼에 페이로드 배치
    ///
    /// 같은 오프셋이면 `Error::DuplicateOffset`, 기존 범위와 겹치면 `Error::OverlappingSegment`.
    pub fn place(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::BufferOverflow { max_size: usize::MAX })?;
        self.check_overlap(offset, end)?;
        self.ensure_capacity(offset, data.len())?;

        let start = offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);

        self.written_len = self.written_len.max(end);
        self.placed.insert(offset, end);
        Ok(())
    }

    fn check_overlap(&self, offset: u64, end: u64) -> Result<()> {
        if let Some((&start, &prev_end)) = self.placed.range(..=offset).next_back() {
            if start == offset {
                return Err(Error::DuplicateOffset { offset });
            }
            if prev_end > offset {
                return Err(Error::OverlappingSegment {
                    offset,
                    existing: start,
                });
            }
        }

        if let Some((&start, _)) = self
            .placed
            .range((Bound::Excluded(offset), Bound::Unbounded))
            .next()
        {
            if start < end {
                return Err(Error::OverlappingSegment {
                    offset,
                    existing: start,
                });
            }
        }
        Ok(())
    }

    /// EOD 카운트 기록
    ///
    /// 같은 값의 반복은 허용, 다른 값이면 `Error::ConflictingEodCount`.
    pub fn set_eod_total(&mut self, total: u32) -> Result<()> {
        match self.eod_total {
            None => {
                self.eod_total = Some(total);
                Ok(())
            }
            Some(existing) if existing == total => Ok(()),
            Some(existing) => Err(Error::ConflictingEodCount {
                existing,
                got: total,
            }),
        }
    }

    /// 연결의 종료 마커 기록, 새로 추가되면 true
    pub fn ack_eod(&mut self, conn_id: usize) -> bool {
        self.eod_acks.insert(conn_id)
    }

    /// 모든 종료 마커 수신 여부
    pub fn completed(&self) -> bool {
        self.eod_total
            .map_or(false, |total| self.eod_acks.len() == total as usize)
    }

    /// 재조립 큐에 데이터 세그먼트 삽입
    pub fn push(&mut self, segment: Segment) -> Result<()> {
        if segment.offset() < self.cursor {
            return Err(Error::OffsetBelowCursor {
                offset: segment.offset(),
                cursor: self.cursor,
            });
        }
        self.queue.push(segment)
    }

    /// 커서 위치에서 최대 max바이트 꺼내기
    pub fn next_delivery(&mut self, max: usize) -> Result<Delivery> {
        let next = match self.queue.peek_min() {
            Some(seg) => seg.offset(),
            None if self.completed() => return Ok(Delivery::Finished),
            None => return Ok(Delivery::Pending),
        };

        if next < self.cursor {
            return Err(Error::OffsetBelowCursor {
                offset: next,
                cursor: self.cursor,
            });
        }

        if next > self.cursor {
            if self.completed() {
                return Err(Error::Gap {
                    cursor: self.cursor,
                    next: Some(next),
                });
            }
            return Ok(Delivery::Pending);
        }

        let mut segment = match self.queue.pop() {
            Some(seg) => seg,
            None => return Ok(Delivery::Pending),
        };

        let front = segment.split_front(max);
        if !segment.is_empty() {
            self.queue.push(segment)?;
        }

        self.cursor += front.len() as u64;
        Ok(Delivery::Ready(front.data))
    }

    /// 수집된 메시지 반환
    ///
    /// 배치된 범위가 0..written_len을 빈틈없이 채우지 않으면 `Error::Gap`.
    pub fn into_message(self) -> Result<Bytes> {
        let mut filled = 0;
        for (&start, &end) in &self.placed {
            if start != filled {
                return Err(Error::Gap {
                    cursor: filled,
                    next: Some(start),
                });
            }
            filled = end;
        }

        let mut buffer = self.buffer;
        buffer.truncate(self.written_len as usize);
        Ok(buffer.freeze())
    }
}
