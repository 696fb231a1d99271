//! 에러 타입 정의

use thiserror::Error;

/// PSA 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    /// 미해결 요청 카운터가 음수로 내려가려 함 (계수 불변식 위반)
    #[error("미해결 요청 수 언더플로우: segment={segment}")]
    OutstandingUnderflow { segment: u64 },

    /// 미해결 요청이 없는 상태에서 RTT 측정값이 보고됨
    #[error("잘못된 RTT 측정: outstanding={outstanding}")]
    InvalidRttMeasurement { outstanding: usize },

    #[error("손상된 프레임: offset={offset}, {reason}")]
    MalformedFrame { offset: usize, reason: &'static str },

    #[error("이미 시작된 스트림")]
    AlreadyStarted,

    #[error("세션 종료됨")]
    SessionClosed,
}

impl Error {
    /// 세션을 즉시 종료해야 하는 불변식 위반 여부
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::OutstandingUnderflow { .. } | Error::InvalidRttMeasurement { .. }
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
