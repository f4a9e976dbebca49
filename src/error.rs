//! 에러 타입 정의

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::scp::ScpResult;

/// SCP 엔진 에러 타입
///
/// 프로세스가 첫 번째 에러를 여러 번 돌려줄 수 있도록 `Clone` 이다.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(Arc<std::io::Error>),

    #[error("IO 에러: {0}")]
    IoProblem(String),

    #[error("타임아웃: {operation} ({timeout:?} 이내 응답 없음)")]
    Timeout { operation: String, timeout: Duration },

    #[error("유효하지 않은 파라미터 {parameter}={value}: {problem}")]
    InvalidParameter {
        parameter: String,
        value: String,
        problem: String,
    },

    /// `result` 는 알려진 코드일 때만 채워진다
    #[error("예상하지 못한 응답 0x{code:02x} ({result:?}): operation={operation}, command={command}")]
    UnexpectedResponseCode {
        operation: String,
        command: String,
        code: u16,
        result: Option<ScpResult>,
    },

    #[error("유효하지 않은 패킷 ({packet_type}): {problem}")]
    InvalidPacket { packet_type: String, problem: String },

    #[error("원격 주소가 없는 연결로는 송신 불가")]
    NotSendable,

    #[error("보드 버퍼 할당 실패: {0}")]
    AllocationFailure(String),

    #[error("연결 없음")]
    NoConnections,

    #[error("이미 닫힌 연결 또는 프로세스")]
    Closed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// 파라미터 에러 생성 헬퍼
    pub fn invalid_parameter(
        parameter: impl Into<String>,
        value: impl ToString,
        problem: impl Into<String>,
    ) -> Self {
        Error::InvalidParameter {
            parameter: parameter.into(),
            value: value.to_string(),
            problem: problem.into(),
        }
    }

    /// 타임아웃 여부
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
