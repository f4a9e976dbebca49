//! 엔진 설정

use std::time::Duration;

use crate::{DEFAULT_SDP_TAG, SCP_SCAMP_PORT};

/// SCP 엔진 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 요청 1회당 응답 대기 시간
    pub scp_timeout: Duration,

    /// 요청당 총 송신 횟수 (첫 송신 포함)
    /// 예: 3 = 최초 1회 + 재전송 2회
    pub n_retries: u32,

    /// 연결당 동시에 응답을 기다릴 수 있는 최대 요청 수
    pub n_channels: usize,

    /// 채널이 가득 찼을 때 이 수 이하로 줄어들 때까지 수신 후 송신 재개
    pub intermediate_channel_waits: usize,

    /// 재시도 결과 코드 (RC_TIMEOUT 등) 수신 후 재전송 전 대기 시간
    pub retry_code_delay: Duration,

    /// 수신 1회에 쓰는 데이터그램 버퍼 크기
    pub receive_buffer_size: usize,

    /// 명시되지 않은 요청에 적용할 SDP 태그
    pub default_sdp_tag: u8,

    /// SCAMP UDP 포트
    pub scamp_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scp_timeout: Duration::from_secs(1),
            n_retries: 3,
            n_channels: 8,
            intermediate_channel_waits: 7,
            retry_code_delay: Duration::from_millis(100),
            receive_buffer_size: 64 * 1024, // 64KB (최대 UDP 데이터그램)
            default_sdp_tag: DEFAULT_SDP_TAG,
            scamp_port: SCP_SCAMP_PORT,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// BMP (보드 관리 프로세서)용 설정
    pub fn bmp() -> Self {
        Self {
            scp_timeout: Duration::from_millis(500),
            n_channels: 1,
            intermediate_channel_waits: 0,
            ..Self::default()
        }
    }

    /// 단일 명령용 설정 (채널 1개)
    pub fn single_command() -> Self {
        Self {
            n_channels: 1,
            intermediate_channel_waits: 0,
            ..Self::default()
        }
    }

    /// 코어 상태 카운트용 설정 (P2P 응답이 느림)
    pub fn count_state() -> Self {
        Self {
            scp_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// 손실이 많은 링크용 설정
    pub fn patient() -> Self {
        Self {
            scp_timeout: Duration::from_secs(2),
            n_retries: 10,
            n_channels: 4,
            intermediate_channel_waits: 2,
            retry_code_delay: Duration::from_millis(250),
            ..Self::default()
        }
    }

    /// 타임아웃 변경
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.scp_timeout = timeout;
        self
    }

    /// 재시도 예산 변경
    pub fn with_retries(mut self, n_retries: u32) -> Self {
        self.n_retries = n_retries;
        self
    }

    /// 채널 수 변경; 대기 임계값은 채널 수보다 작게 맞춘다
    pub fn with_channels(mut self, n_channels: usize, intermediate_channel_waits: usize) -> Self {
        self.n_channels = n_channels.max(1);
        self.intermediate_channel_waits = intermediate_channel_waits.min(self.n_channels - 1);
        self
    }
}
