//! 요청/응답 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// RTT 샘플 보관 개수
const RTT_WINDOW: usize = 32;

/// 연결(파이프라인)별 통계
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// 연결 설명 (로그용)
    pub connection: String,

    /// 새로 보낸 요청 수 (재전송 제외)
    pub requests: u64,

    /// 성공으로 끝난 요청 수
    pub responses: u64,

    /// 수신 타임아웃 발생 횟수
    pub n_timeouts: u64,

    /// 타임아웃으로 재전송한 데이터그램 수
    pub n_resent: u64,

    /// 재시도 결과 코드로 재전송한 데이터그램 수
    pub n_retry_code_resent: u64,

    /// 시퀀스가 맞지 않아 버린 응답 수
    pub n_stale: u64,

    /// 최근 RTT 샘플 (마이크로초)
    rtt_samples: VecDeque<u64>,
}

impl PipelineStats {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            requests: 0,
            responses: 0,
            n_timeouts: 0,
            n_resent: 0,
            n_retry_code_resent: 0,
            n_stale: 0,
            rtt_samples: VecDeque::with_capacity(RTT_WINDOW),
        }
    }

    /// 응답 도착 기록
    pub fn record_response(&mut self, rtt: Duration) {
        if self.rtt_samples.len() >= RTT_WINDOW {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt.as_micros() as u64);
    }

    /// 평균 RTT
    pub fn average_rtt_us(&self) -> Option<u64> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        Some(self.rtt_samples.iter().sum::<u64>() / self.rtt_samples.len() as u64)
    }

    /// 총 송신 데이터그램 수
    pub fn datagrams_sent(&self) -> u64 {
        self.requests + self.n_resent + self.n_retry_code_resent
    }
}

/// 프로세스 전체 통계
#[derive(Debug, Clone)]
pub struct ProcessStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 연결별 통계
    pub pipelines: Vec<PipelineStats>,

    /// 실패한 요청 수
    pub n_errors: u64,
}

impl ProcessStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            pipelines: Vec::new(),
            n_errors: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn requests(&self) -> u64 {
        self.pipelines.iter().map(|p| p.requests).sum()
    }

    pub fn n_timeouts(&self) -> u64 {
        self.pipelines.iter().map(|p| p.n_timeouts).sum()
    }

    pub fn n_resent(&self) -> u64 {
        self.pipelines.iter().map(|p| p.n_resent).sum()
    }

    pub fn n_retry_code_resent(&self) -> u64 {
        self.pipelines.iter().map(|p| p.n_retry_code_resent).sum()
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.pipelines.iter().map(PipelineStats::datagrams_sent).sum()
    }

    /// 재전송 비율
    pub fn resend_ratio(&self) -> f64 {
        let sent = self.datagrams_sent();
        if sent == 0 {
            return 0.0;
        }
        (self.n_resent() + self.n_retry_code_resent()) as f64 / sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Connections: {} | Requests: {} | Sent: {} | Timeouts: {} | Resent: {} | Retry codes: {} | Errors: {}",
            self.elapsed().as_secs_f64(),
            self.pipelines.len(),
            self.requests(),
            self.datagrams_sent(),
            self.n_timeouts(),
            self.n_resent(),
            self.n_retry_code_resent(),
            self.n_errors,
        )
    }
}

impl Default for ProcessStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        let mut a = PipelineStats::new("a");
        a.requests = 10;
        a.n_resent = 2;
        let mut b = PipelineStats::new("b");
        b.requests = 5;
        b.n_retry_code_resent = 3;

        let mut stats = ProcessStats::new();
        stats.pipelines = vec![a, b];
        assert_eq!(stats.requests(), 15);
        assert_eq!(stats.datagrams_sent(), 20);
        assert!((stats.resend_ratio() - 0.25).abs() < 1e-9);
        assert!(stats.summary().contains("Requests: 15"));
    }

    #[test]
    fn test_rtt_window() {
        let mut stats = PipelineStats::new("x");
        assert_eq!(stats.average_rtt_us(), None);
        for _ in 0..(RTT_WINDOW + 5) {
            stats.record_response(Duration::from_micros(100));
        }
        stats.record_response(Duration::from_micros(100 + RTT_WINDOW as u64));
        assert_eq!(stats.average_rtt_us(), Some(101));
    }
}
