//! 네트워크 협력자
//!
//! 세션은 [`Network`]로 요청만 내보내고, 응답과 타임아웃은
//! [`NetworkEvent`] 채널로 돌려받는다. 전송 자체는 절대 블로킹하지 않는다.
//!
//! [`UdpNetwork`]는 이름 기반 요청/응답을 UDP 위에 얹은 구현:
//! - 송신 태스크: 요청 인코딩 + 전송 + 대기 목록 등록
//! - 수신 태스크: 디코딩, CRC 검증, 대기 중인 요청과 매칭
//! - 만료 태스크: 수명이 지난 요청을 `Timeout`으로 보고

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::{Message, RequestMessage, SegmentNumber, SegmentRequest, SegmentResponse, StreamName};
use crate::Result;

/// 네트워크 이벤트 수신기 타입
pub type NetworkEventReceiver = mpsc::Receiver<NetworkEvent>;

/// 네트워크 → 세션 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// 요청에 대한 응답 (콘텐츠 또는 스트림 종료)
    Response(SegmentResponse),

    /// 요청 수명 만료
    Timeout {
        name: StreamName,
        segment: SegmentNumber,
    },
}

/// 요청 송신 인터페이스
pub trait Network: Send {
    /// 비동기로 요청 전송. 결과는 이벤트 채널로 도착한다.
    fn send_request(&mut self, request: SegmentRequest);
}

impl<N: Network + ?Sized> Network for Box<N> {
    fn send_request(&mut self, request: SegmentRequest) {
        (**self).send_request(request)
    }
}

/// 만료 검사 주기
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// 대기 중인 요청 (이름, 세그먼트) → 만료 시각
type PendingMap = Arc<Mutex<HashMap<(StreamName, SegmentNumber), Instant>>>;

/// UDP 기반 네트워크
pub struct UdpNetwork {
    request_tx: mpsc::UnboundedSender<SegmentRequest>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl UdpNetwork {
    /// 소켓 바인드 후 송수신 태스크 시작
    pub async fn connect(
        bind_addr: SocketAddr,
        remote_addr: SocketAddr,
        event_capacity: usize,
    ) -> Result<(Self, NetworkEventReceiver)> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<SegmentRequest>();
        let (event_tx, event_rx) = mpsc::channel::<NetworkEvent>(event_capacity);

        let running = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        info!("UDP 네트워크 시작: {} -> {}", local_addr, remote_addr);

        // 송신 태스크
        let socket_send = socket.clone();
        let pending_send = pending.clone();
        let running_send = running.clone();

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                if !running_send.load(Ordering::SeqCst) {
                    break;
                }

                let bytes = match RequestMessage::from_request(&request).to_bytes() {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("요청 인코딩 실패: {}", e);
                        continue;
                    }
                };

                pending_send.lock().insert(
                    (request.name.clone(), request.segment),
                    Instant::now() + request.lifetime,
                );

                if let Err(e) = socket_send.send_to(&bytes, remote_addr).await {
                    // 전송 실패도 만료 태스크가 타임아웃으로 보고한다
                    warn!("요청 전송 실패: segment={}, {}", request.segment, e);
                }
            }
        });

        // 수신 태스크
        let socket_recv = socket.clone();
        let pending_recv = pending.clone();
        let running_recv = running.clone();
        let event_tx_recv = event_tx.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];

            while running_recv.load(Ordering::SeqCst) {
                match tokio::time::timeout(Duration::from_millis(10), socket_recv.recv_from(&mut buf)).await {
                    Ok(Ok((len, addr))) => {
                        let response = match Message::from_bytes(&buf[..len]).map(Message::into_response) {
                            Ok(Some(Ok(r))) => r,
                            Ok(Some(Err(e))) | Err(e) => {
                                warn!("손상된 패킷 무시 ({}): {}", addr, e);
                                continue;
                            }
                            Ok(None) => {
                                debug!("요청 메시지 무시 ({})", addr);
                                continue;
                            }
                        };

                        let key = (response.name.clone(), response.segment);
                        if pending_recv.lock().remove(&key).is_none() {
                            debug!(
                                "대기 중이 아닌 응답 무시: {} segment={}",
                                response.name, response.segment
                            );
                            continue;
                        }

                        if event_tx_recv.send(NetworkEvent::Response(response)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                    }
                    Err(_) => {
                        // 타임아웃, 계속
                    }
                }
            }
        });

        // 만료 태스크
        let running_expiry = running.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);

            while running_expiry.load(Ordering::SeqCst) {
                ticker.tick().await;
                let now = Instant::now();

                let expired: Vec<(StreamName, SegmentNumber)> = {
                    let mut pending = pending.lock();
                    let keys: Vec<_> = pending
                        .iter()
                        .filter(|(_, deadline)| now >= **deadline)
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in &keys {
                        pending.remove(key);
                    }
                    keys
                };

                for (name, segment) in expired {
                    debug!("요청 수명 만료: {} segment={}", name, segment);
                    if event_tx.send(NetworkEvent::Timeout { name, segment }).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok((
            Self {
                request_tx,
                running,
                local_addr,
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 태스크 정지
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Network for UdpNetwork {
    fn send_request(&mut self, request: SegmentRequest) {
        if self.request_tx.send(request).is_err() {
            warn!("송신 태스크 종료됨, 요청 버림");
        }
    }
}

impl Drop for UdpNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DataMessage, NackMessage};

    fn name() -> StreamName {
        StreamName::parse("/test/stream").unwrap()
    }

    async fn peer() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_request(socket: &UdpSocket) -> (RequestMessage, SocketAddr) {
        let mut buf = vec![0u8; 2048];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        match Message::from_bytes(&buf[..len]).unwrap() {
            Message::Request(r) => (r, from),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_and_response() {
        let (server, server_addr) = peer().await;
        let (mut net, mut events) = UdpNetwork::connect("127.0.0.1:0".parse().unwrap(), server_addr, 16)
            .await
            .unwrap();

        net.send_request(SegmentRequest {
            name: name(),
            segment: 4,
            lifetime: Duration::from_secs(5),
        });

        let (request, from) = recv_request(&server).await;
        assert_eq!(request.segment, 4);
        assert_eq!(request.lifetime(), Duration::from_secs(5));

        let reply = DataMessage::new(&name(), 4, b"payload", Some(4)).to_bytes().unwrap();
        server.send_to(&reply, from).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            NetworkEvent::Response(r) => {
                assert_eq!(r.segment, 4);
                assert!(!r.is_end_of_stream());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lifetime_expiry_reported() {
        let (_server, server_addr) = peer().await;
        let (mut net, mut events) = UdpNetwork::connect("127.0.0.1:0".parse().unwrap(), server_addr, 16)
            .await
            .unwrap();

        net.send_request(SegmentRequest {
            name: name(),
            segment: 9,
            lifetime: Duration::from_millis(50),
        });

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            NetworkEvent::Timeout {
                name: name(),
                segment: 9
            }
        );
    }

    #[tokio::test]
    async fn test_unsolicited_response_dropped() {
        let (server, server_addr) = peer().await;
        let (mut net, mut events) = UdpNetwork::connect("127.0.0.1:0".parse().unwrap(), server_addr, 16)
            .await
            .unwrap();

        net.send_request(SegmentRequest {
            name: name(),
            segment: 1,
            lifetime: Duration::from_secs(5),
        });
        let (_, from) = recv_request(&server).await;

        // 요청하지 않은 세그먼트 먼저, 그 다음 요청한 세그먼트
        let stray = NackMessage::new(&name(), 2, 1).to_bytes().unwrap();
        server.send_to(&stray, from).await.unwrap();
        let wanted = NackMessage::new(&name(), 1, 1).to_bytes().unwrap();
        server.send_to(&wanted, from).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            NetworkEvent::Response(r) => assert_eq!(r.segment, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
