//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 세그먼트 처리 기록
#[derive(Debug, Clone, Copy)]
struct SegmentRecord {
    timestamp: Instant,
    size: usize,
}

/// 연결별 통계
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// 연결 ID
    pub conn_id: usize,

    /// 최근 세그먼트 기록
    records: VecDeque<SegmentRecord>,

    /// 윈도우 크기
    window_size: usize,

    /// 총 데이터 세그먼트 수
    pub segments: u64,

    /// 총 페이로드 바이트
    pub bytes: u64,

    /// 이 연결이 운반한 제어 세그먼트 수
    pub control_segments: u64,

    /// 종료 마커 송수신 여부
    pub terminated: bool,

    /// 마지막 활동 시간
    pub last_activity: Option<Instant>,
}

impl ConnectionStats {
    pub fn new(conn_id: usize, window_size: usize) -> Self {
        Self {
            conn_id,
            records: VecDeque::with_capacity(window_size),
            window_size: window_size.max(2),
            segments: 0,
            bytes: 0,
            control_segments: 0,
            terminated: false,
            last_activity: None,
        }
    }

    /// 데이터 세그먼트 기록
    pub fn record_segment(&mut self, size: usize) {
        let now = Instant::now();

        if self.records.len() >= self.window_size {
            self.records.pop_front();
        }
        self.records.push_back(SegmentRecord {
            timestamp: now,
            size,
        });

        self.segments += 1;
        self.bytes += size as u64;
        self.last_activity = Some(now);
    }

    pub fn record_control(&mut self) {
        self.control_segments += 1;
        self.last_activity = Some(Instant::now());
    }

    pub fn record_terminal(&mut self) {
        self.terminated = true;
        self.last_activity = Some(Instant::now());
    }

    /// 윈도우 기준 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let (first, last) = match (self.records.front(), self.records.back()) {
            (Some(first), Some(last)) if self.records.len() >= 2 => (first, last),
            _ => return 0.0,
        };

        let duration = last.timestamp.duration_since(first.timestamp);
        if duration.is_zero() {
            return 0.0;
        }

        let total_size: usize = self.records.iter().map(|r| r.size).sum();
        total_size as f64 / duration.as_secs_f64()
    }
}

/// 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 총 페이로드 바이트
    pub total_bytes: u64,

    /// 총 데이터 세그먼트 수
    pub total_segments: u64,

    /// 연결별 통계
    pub connections: Vec<ConnectionStats>,
}

impl TransferStats {
    pub fn new(connection_count: usize, window_size: usize) -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes: 0,
            total_segments: 0,
            connections: (0..connection_count)
                .map(|i| ConnectionStats::new(i, window_size))
                .collect(),
        }
    }

    pub fn record_segment(&mut self, conn_id: usize, size: usize) {
        self.total_segments += 1;
        self.total_bytes += size as u64;
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.record_segment(size);
        }
    }

    pub fn record_control(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.record_control();
        }
    }

    pub fn record_terminal(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.record_terminal();
        }
    }

    /// 제어 세그먼트 총 수
    pub fn control_segments(&self) -> u64 {
        self.connections.iter().map(|c| c.control_segments).sum()
    }

    /// 종료 마커를 처리한 연결 수
    pub fn terminated_connections(&self) -> usize {
        self.connections.iter().filter(|c| c.terminated).count()
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 처리율 (bytes/sec)
    pub fn overall_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 연결별 바이트 비율
    pub fn connection_ratios(&self) -> Vec<f64> {
        let count = self.connections.len();
        if count == 0 {
            return Vec::new();
        }
        if self.total_bytes == 0 {
            // 균등 분배
            return vec![1.0 / count as f64; count];
        }

        self.connections
            .iter()
            .map(|c| c.bytes as f64 / self.total_bytes as f64)
            .collect()
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let per_conn: Vec<String> = self
            .connections
            .iter()
            .map(|c| format!("#{}:{}", c.conn_id, c.segments))
            .collect();

        format!(
            "Elapsed: {:.2}s | Segments: {} | Bytes: {} | Throughput: {:.2} MB/s | Connections: {}/{} terminated | Per-conn: [{}]",
            self.elapsed().as_secs_f64(),
            self.total_segments,
            self.total_bytes,
            self.overall_throughput() / 1_000_000.0,
            self.terminated_connections(),
            self.connections.len(),
            per_conn.join(" "),
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(1, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_ratios() {
        let mut stats = TransferStats::new(2, 10);
        assert_eq!(stats.connection_ratios(), vec![0.5, 0.5]);

        stats.record_control(1);
        stats.record_segment(0, 300);
        stats.record_segment(1, 100);
        stats.record_terminal(0);

        assert_eq!(stats.total_segments, 2);
        assert_eq!(stats.total_bytes, 400);
        assert_eq!(stats.control_segments(), 1);
        assert_eq!(stats.terminated_connections(), 1);
        assert_eq!(stats.connection_ratios(), vec![0.75, 0.25]);
        assert!(stats.summary().contains("Segments: 2"));
    }

    #[test]
    fn test_unknown_connection_is_ignored_per_conn() {
        let mut stats = TransferStats::new(1, 10);
        stats.record_segment(5, 10);
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(stats.connections[0].bytes, 0);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut conn = ConnectionStats::new(0, 3);
        for _ in 0..10 {
            conn.record_segment(1);
        }
        assert_eq!(conn.records.len(), 3);
        assert_eq!(conn.segments, 10);
    }
}
