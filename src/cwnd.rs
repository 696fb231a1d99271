//! 혼잡 윈도우 정책
//!
//! 동시에 나가 있을 수 있는 요청 수의 상한을 정한다. 페치 스케줄러는
//! [`CongestionWindow`] 트레이트만 보므로 AIMD 같은 적응형 정책으로
//! 바꿔 끼워도 호출 측은 바뀌지 않는다.

/// 혼잡 윈도우 정책 인터페이스
pub trait CongestionWindow: Send + std::fmt::Debug {
    /// 현재 허용되는 최대 미해결 요청 수
    fn current_window(&self) -> usize;

    /// 미해결 요청이 `outstanding`개일 때 하나 더 보낼 수 있는지
    fn within_window(&self, outstanding: usize) -> bool {
        outstanding < self.current_window()
    }

    /// 응답 수신 시 호출
    fn on_response(&mut self) {}

    /// RTO 만료 시 호출
    fn on_timeout(&mut self) {}
}

/// 고정 크기 윈도우
#[derive(Debug, Clone, Copy)]
pub struct FixedWindow {
    size: usize,
}

impl FixedWindow {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl Default for FixedWindow {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_CWND)
    }
}

impl CongestionWindow for FixedWindow {
    fn current_window(&self) -> usize {
        self.size
    }
}
