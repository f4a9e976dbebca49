//! # SCAMP link
//!
//! UDP 기반 SDP/SCP 요청/응답 프로토콜 엔진
//!
//! ## 핵심 특징
//! - **SCP 코덱**: 2바이트 패딩 + SDP 헤더 + SCP 헤더 + 페이로드 (리틀 엔디언)
//! - **윈도우 파이프라인**: 연결당 채널 수 제한, 시퀀스 번호로 응답 매칭
//! - **재전송**: 요청별 타임아웃과 재시도 예산, 첫 에러만 보고
//! - **응답 분배**: 연결을 공유하는 프로세스끼리 시퀀스 번호로 응답을 나눔
//! - **연결 선택**: Fixed / RoundRobin / MostDirect (트라이어드 기하)
//! - **Flood-fill**: Start/Data/End 대량 적재, 전역 배타 락
//! - **실행 락**: 칩 단위 실행과 flood-fill 간 상호 배제

pub mod command;
pub mod config;
pub mod connection;
pub mod cores;
pub mod diagnostic;
pub mod dispatch;
pub mod emulator;
pub mod error;
pub mod flood;
pub mod lock;
pub mod pipeline;
pub mod process;
pub mod scp;
pub mod selector;
pub mod session;
pub mod stats;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use connection::{
    AnyConnection, BmpConnection, BootConnection, Connection, ConnectionPools, ScampConnection,
    ScpConnection, UdpConnection,
};
pub use cores::{ChipCoord, CoreSubset, CoreSubsets, CpuState};
pub use diagnostic::DiagnosticFilter;
pub use dispatch::{Dispatchers, ResponseDispatcher};
pub use error::{Error, Result};
pub use flood::{FloodFillLoader, NearestNeighbourIds};
pub use lock::ExecutionLocks;
pub use process::ScpProcess;
pub use scp::{ScpCommand, ScpRequest, ScpResponse, ScpResult, SdpFlag, SdpHeader};
pub use selector::{
    ConnectionSelector, FixedConnectionSelector, MachineTopology, MostDirectConnectionSelector,
    RoundRobinConnectionSelector,
};
pub use session::Session;
pub use stats::ProcessStats;

/// SCAMP 가 SCP 요청을 받는 UDP 포트
pub const SCP_SCAMP_PORT: u16 = 17893;

/// 부트 메시지 UDP 포트
pub const UDP_BOOT_CONNECTION_DEFAULT_PORT: u16 = 54321;

/// 요청 하나에 실을 수 있는 최대 페이로드 (바이트)
pub const UDP_MESSAGE_MAX_SIZE: usize = 256;

/// 데이터그램 하나에 실을 수 있는 최대 워드 수
pub const MAX_WORDS_PER_DATAGRAM: usize = UDP_MESSAGE_MAX_SIZE / 4;

/// 태그 미지정 시 기본 SDP 태그
pub const DEFAULT_SDP_TAG: u8 = 0xFF;

/// 실행 파일 적재 주소
pub const EXECUTABLE_ADDRESS: u32 = 0x6780_0000;
