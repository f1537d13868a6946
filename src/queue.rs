//! 오프셋 순서 재조립 큐
//!
//! 여러 연결에서 순서 없이 도착한 세그먼트를 오프셋 오름차순으로 보관

use std::collections::BTreeMap;

use crate::segment::Segment;
use crate::{Error, Result};

/// 재조립 큐
#[derive(Debug, Default)]
pub struct ReassemblyQueue {
    segments: BTreeMap<u64, Segment>,

    /// 큐에 있는 페이로드 총 바이트
    queued_bytes: usize,
}

impl ReassemblyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 세그먼트 삽입, O(log n)
    ///
    /// 같은 오프셋이 이미 있으면 `Error::DuplicateOffset`.
    pub fn push(&mut self, segment: Segment) -> Result<()> {
        let offset = segment.offset();
        if self.segments.contains_key(&offset) {
            return Err(Error::DuplicateOffset { offset });
        }

        self.queued_bytes += segment.len();
        self.segments.insert(offset, segment);
        Ok(())
    }

    /// 최소 오프셋 세그먼트
    pub fn peek_min(&self) -> Option<&Segment> {
        self.segments.first_key_value().map(|(_, seg)| seg)
    }

    /// 최소 오프셋 세그먼트 제거 후 반환
    pub fn pop(&mut self) -> Option<Segment> {
        let (_, segment) = self.segments.pop_first()?;
        self.queued_bytes -= segment.len();
        Some(segment)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Flags;
    use bytes::Bytes;

    fn seg(offset: u64, len: usize) -> Segment {
        Segment::data(Bytes::from(vec![offset as u8; len]), offset, Flags::NONE)
    }

    #[test]
    fn test_pops_in_offset_order() {
        let mut queue = ReassemblyQueue::new();
        for offset in [12, 0, 8, 4] {
            queue.push(seg(offset, 4)).unwrap();
        }

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.queued_bytes(), 16);
        assert_eq!(queue.peek_min().map(Segment::offset), Some(0));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|s| s.offset()).collect();
        assert_eq!(order, vec![0, 4, 8, 12]);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_duplicate_offset_rejected() {
        let mut queue = ReassemblyQueue::new();
        queue.push(seg(4, 4)).unwrap();

        let err = queue.push(seg(4, 2)).unwrap_err();
        assert_eq!(err, Error::DuplicateOffset { offset: 4 });
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = ReassemblyQueue::new();
        assert!(queue.peek_min().is_none());
        assert!(queue.pop().is_none());
    }
}
