//! 메시지 정의
//!
//! - 세션 내부 모델: 스트림 이름, 세그먼트 요청, 응답(콘텐츠 / 스트림 종료)
//! - UDP 와이어 포맷: 헤더(매직 + 버전 + 타입 + 길이) 뒤에 bincode 페이로드

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 세그먼트 번호 (0부터 시작)
pub type SegmentNumber = u64;

/// 계층형 스트림 이름 (`/a/b/c`)
///
/// 이벤트마다 복제되므로 `Arc<str>`로 공유한다.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamName(Arc<str>);

impl StreamName {
    /// 슬래시 구분 이름 파싱. 빈 컴포넌트는 무시한다.
    pub fn parse(name: &str) -> Result<Self> {
        let components: Vec<&str> = name.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Err(Error::InvalidConfig(format!("빈 스트림 이름: {:?}", name)));
        }
        Ok(Self(Arc::from(format!("/{}", components.join("/")))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 세그먼트 요청 (세션 → 네트워크)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub name: StreamName,
    pub segment: SegmentNumber,
    /// 요청 유효 시간. 지나면 네트워크가 타임아웃을 보고한다.
    pub lifetime: Duration,
}

/// 응답 내용
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseContent {
    /// 오디오 바이트 (프레임 0개 이상) + 선택적 최종 블록 ID 메타데이터
    Content {
        data: Bytes,
        final_block_id: Option<SegmentNumber>,
    },
    /// 스트림 종료 신호 (NACK)
    EndOfStream { final_block_id: SegmentNumber },
}

/// 세그먼트 응답 (네트워크 → 세션)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentResponse {
    pub name: StreamName,
    pub segment: SegmentNumber,
    pub content: ResponseContent,
}

impl SegmentResponse {
    pub fn content(name: StreamName, segment: SegmentNumber, data: Bytes) -> Self {
        Self {
            name,
            segment,
            content: ResponseContent::Content {
                data,
                final_block_id: None,
            },
        }
    }

    pub fn end_of_stream(name: StreamName, segment: SegmentNumber, final_block_id: SegmentNumber) -> Self {
        Self {
            name,
            segment,
            content: ResponseContent::EndOfStream { final_block_id },
        }
    }

    /// 최종 블록 ID 메타데이터 추가 (콘텐츠 응답일 때만)
    pub fn with_final_block_id(mut self, id: SegmentNumber) -> Self {
        if let ResponseContent::Content { final_block_id, .. } = &mut self.content {
            *final_block_id = Some(id);
        }
        self
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.content, ResponseContent::EndOfStream { .. })
    }
}

// ---------------------------------------------------------------------------
// 와이어 포맷
// ---------------------------------------------------------------------------

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// 세그먼트 요청 (클라이언트 → 서버)
    Request = 1,

    /// 세그먼트 데이터 (서버 → 클라이언트)
    Data = 2,

    /// 스트림 종료 NACK (서버 → 클라이언트)
    Nack = 3,
}

/// 메시지 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입
    pub msg_type: MessageType,

    /// 메시지 길이 (헤더 제외)
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            msg_type,
            payload_len,
        }
    }

    /// 매직 넘버와 버전 확인
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: self.magic,
            });
        }
        if self.version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: self.version,
            });
        }
        Ok(())
    }
}

fn encode<T: Serialize>(msg_type: MessageType, body: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(body)?;
    let header = MessageHeader::new(msg_type, payload.len() as u32);
    let header_bytes = bincode::serialize(&header)?;

    let mut buf = Vec::with_capacity(header_bytes.len() + payload.len());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// 헤더를 읽고 검증한 뒤 (헤더, 페이로드 슬라이스) 반환
fn split_header(bytes: &[u8]) -> Result<(MessageHeader, &[u8])> {
    let header: MessageHeader = bincode::deserialize(bytes)?;
    header.validate()?;

    // bincode 헤더 크기는 고정이지만 직접 계산해서 확인
    let header_size = bincode::serialized_size(&header)? as usize;
    let payload = bytes.get(header_size..).unwrap_or_default();
    let len = header.payload_len as usize;
    if payload.len() < len {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated payload",
        )));
    }
    Ok((header, &payload[..len]))
}

fn decode_body<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}

/// 세그먼트 요청 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub name: String,
    pub segment: SegmentNumber,
    pub lifetime_ms: u64,
}

impl RequestMessage {
    pub fn from_request(request: &SegmentRequest) -> Self {
        Self {
            name: request.name.to_string(),
            segment: request.segment,
            lifetime_ms: request.lifetime.as_millis() as u64,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(MessageType::Request, self)
    }

    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }
}

/// 세그먼트 데이터 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub name: String,
    pub segment: SegmentNumber,

    /// 마지막 세그먼트에만 설정
    pub final_block_id: Option<SegmentNumber>,

    /// 콘텐츠 CRC32
    pub crc32: u32,

    pub data: Vec<u8>,
}

impl DataMessage {
    pub fn new(name: &StreamName, segment: SegmentNumber, data: &[u8], final_block_id: Option<SegmentNumber>) -> Self {
        Self {
            name: name.to_string(),
            segment,
            final_block_id,
            crc32: crc32fast::hash(data),
            data: data.to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(MessageType::Data, self)
    }

    /// CRC 검증
    pub fn verify(&self) -> Result<()> {
        let actual = crc32fast::hash(&self.data);
        if actual != self.crc32 {
            return Err(Error::CrcMismatch {
                expected: self.crc32,
                got: actual,
            });
        }
        Ok(())
    }

    /// 검증 후 세션 응답으로 변환
    pub fn into_response(self) -> Result<SegmentResponse> {
        self.verify()?;
        Ok(SegmentResponse {
            name: StreamName::parse(&self.name)?,
            segment: self.segment,
            content: ResponseContent::Content {
                data: Bytes::from(self.data),
                final_block_id: self.final_block_id,
            },
        })
    }
}

/// 스트림 종료 NACK 메시지
///
/// 요청한 세그먼트가 스트림 끝을 넘었을 때 최종 블록 ID를 담아 응답
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackMessage {
    pub name: String,
    pub segment: SegmentNumber,
    pub final_block_id: SegmentNumber,
}

impl NackMessage {
    pub fn new(name: &StreamName, segment: SegmentNumber, final_block_id: SegmentNumber) -> Self {
        Self {
            name: name.to_string(),
            segment,
            final_block_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(MessageType::Nack, self)
    }

    pub fn into_response(self) -> Result<SegmentResponse> {
        Ok(SegmentResponse::end_of_stream(
            StreamName::parse(&self.name)?,
            self.segment,
            self.final_block_id,
        ))
    }
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(RequestMessage),
    Data(DataMessage),
    Nack(NackMessage),
}

impl Message {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Data(_) => MessageType::Data,
            Message::Nack(_) => MessageType::Nack,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Message::Request(m) => m.to_bytes(),
            Message::Data(m) => m.to_bytes(),
            Message::Nack(m) => m.to_bytes(),
        }
    }

    /// 바이트에서 역직렬화 (헤더 검증 포함)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (header, payload) = split_header(bytes)?;
        let msg = match header.msg_type {
            MessageType::Request => Message::Request(decode_body(payload)?),
            MessageType::Data => Message::Data(decode_body(payload)?),
            MessageType::Nack => Message::Nack(decode_body(payload)?),
        };
        Ok(msg)
    }

    /// 응답 메시지면 세션 응답으로 변환 (요청은 None)
    pub fn into_response(self) -> Option<Result<SegmentResponse>> {
        match self {
            Message::Request(_) => None,
            Message::Data(m) => Some(m.into_response()),
            Message::Nack(m) => Some(m.into_response()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name() -> StreamName {
        StreamName::parse("/alice/mic/stream").unwrap()
    }

    #[test]
    fn test_stream_name() {
        let n = StreamName::parse("alice//mic/stream/").unwrap();
        assert_eq!(n, name());
        assert_eq!(n.to_string(), "/alice/mic/stream");
        assert!(StreamName::parse("///").is_err());
    }

    #[test]
    fn test_data_message_final_block_metadata() {
        let msg = DataMessage::new(&name(), 7, b"frames", Some(7));
        let bytes = msg.to_bytes().unwrap();

        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.msg_type(), MessageType::Data);

        let response = decoded.into_response().unwrap().unwrap();
        assert_eq!(response.segment, 7);
        assert_eq!(
            response.content,
            ResponseContent::Content {
                data: Bytes::from_static(b"frames"),
                final_block_id: Some(7)
            }
        );
    }

    #[test]
    fn test_nack_becomes_end_of_stream() {
        let bytes = NackMessage::new(&name(), 12, 9).to_bytes().unwrap();
        let response = Message::from_bytes(&bytes)
            .unwrap()
            .into_response()
            .unwrap()
            .unwrap();
        assert!(response.is_end_of_stream());
        assert_eq!(
            response.content,
            ResponseContent::EndOfStream { final_block_id: 9 }
        );
    }

    #[test]
    fn test_request_is_not_a_response() {
        let request = SegmentRequest {
            name: name(),
            segment: 3,
            lifetime: Duration::from_millis(450),
        };
        let msg = RequestMessage::from_request(&request);
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, Message::Request(msg));
        assert!(decoded.into_response().is_none());
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut msg = DataMessage::new(&name(), 1, b"abc", None);
        msg.data[0] ^= 0xFF;
        assert!(matches!(msg.into_response(), Err(Error::CrcMismatch { .. })));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = NackMessage::new(&name(), 1, 0).to_bytes().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::InvalidMagicNumber { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = DataMessage::new(&name(), 1, &[0u8; 64], None).to_bytes().unwrap();
        assert!(Message::from_bytes(&bytes[..bytes.len() - 10]).is_err());
    }

    #[test]
    fn test_payload_bounded_by_header_length() {
        let mut bytes = NackMessage::new(&name(), 9, 4).to_bytes().unwrap();
        bytes.extend_from_slice(&[0xFF; 8]);

        let response = Message::from_bytes(&bytes)
            .unwrap()
            .into_response()
            .unwrap()
            .unwrap();
        assert_eq!(response.segment, 9);
        assert!(response.is_end_of_stream());
    }
}
