//! 전송 설정

use crate::transmission::MIN_BUFFER_CAPACITY;
use crate::{Error, Result, DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_SEGMENT_LEN};

/// 스트라이핑 전송 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 세그먼트 최대 길이 (바이트, 송신측 L)
    pub max_segment_len: usize,

    /// 수신 허용 최대 페이로드 길이 (바이트)
    /// 손상된 헤더가 거대한 할당을 유발하지 않도록 제한
    pub max_payload_len: usize,

    /// 메시지 수집 버퍼 초기 용량
    pub initial_buffer_capacity: usize,

    /// 연결별 처리율 측정 윈도우 (세그먼트 수)
    pub stats_window_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_segment_len: DEFAULT_SEGMENT_LEN,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            initial_buffer_capacity: MIN_BUFFER_CAPACITY,
            stats_window_size: 100,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 세그먼트 길이 지정
    pub fn with_max_segment_len(mut self, len: usize) -> Self {
        self.max_segment_len = len;
        self
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_len == 0 {
            return Err(Error::InvalidConfig("max_segment_len은 1 이상이어야 함".into()));
        }
        if self.max_payload_len < self.max_segment_len {
            return Err(Error::InvalidConfig(format!(
                "max_payload_len({})이 max_segment_len({})보다 작음",
                self.max_payload_len, self.max_segment_len
            )));
        }
        Ok(())
    }

    /// 주어진 길이를 세그먼트로 나눌 때의 데이터 세그먼트 수
    ///
    /// `validate()`를 통과한 설정이어야 한다.
    pub fn segments_for(&self, len: u64) -> u64 {
        len.div_ceil(self.max_segment_len as u64)
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            max_segment_len: 16 * 1024,        // 16KB
            max_payload_len: 1024 * 1024,      // 1MB
            initial_buffer_capacity: 64 * 1024,
            stats_window_size: 50,
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            max_segment_len: 1024 * 1024,      // 1MB
            max_payload_len: 64 * 1024 * 1024, // 64MB
            initial_buffer_capacity: 8 * 1024 * 1024,
            stats_window_size: 200,
        }
    }
}
