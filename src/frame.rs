//! 프레임 분할
//!
//! - Segment 페이로드: ADTS 프레임 0개 이상을 이어 붙인 바이트열
//! - Frame: 헤더에 13비트 길이 필드를 가진 디코딩 단위 (헤더 포함 길이)
//!
//! 길이 필드는 헤더 3~5번째 바이트에 걸쳐 있다:
//! `(b[3] & 0x03) << 11 | b[4] << 3 | b[5] >> 5`

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// CRC 없는 ADTS 헤더 길이
pub const ADTS_HEADER_LEN: usize = 7;

/// 13비트 길이 필드의 최대값
pub const MAX_FRAME_LEN: usize = 0x1FFF;

/// 길이 필드를 읽기 위해 필요한 최소 바이트 수
const LENGTH_FIELD_END: usize = 6;

/// ADTS 샘플링 주파수 인덱스 테이블
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// 프레임 번호 (segment_number * frames_per_segment + 세그먼트 내 인덱스)
pub type FrameNumber = u64;

/// 헤더의 프레임 길이 필드 읽기
///
/// 버퍼가 길이 필드를 담기에 짧으면 None
pub fn read_frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < LENGTH_FIELD_END {
        return None;
    }
    let len = ((header[3] as usize & 0x03) << 11)
        | ((header[4] as usize) << 3)
        | ((header[5] as usize) >> 5);
    Some(len)
}

/// 세그먼트 페이로드를 프레임 단위로 자르는 반복자
///
/// `Bytes`를 공유하므로 복제 비용이 없고, 복제한 반복자는 처음부터 다시 돈다.
/// 손상된 길이 필드를 만나면 에러 한 번을 내고 끝난다.
#[derive(Debug, Clone)]
pub struct Frames {
    data: Bytes,
    offset: usize,
    done: bool,
}

impl Frames {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            offset: 0,
            done: false,
        }
    }

    /// 처음 위치로 되감기
    pub fn restart(&mut self) {
        self.offset = 0;
        self.done = false;
    }

    fn fail(&mut self, reason: &'static str) -> Option<Result<Bytes>> {
        self.done = true;
        Some(Err(Error::MalformedFrame {
            offset: self.offset,
            reason,
        }))
    }
}

impl Iterator for Frames {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            self.done = true;
            return None;
        }

        let rest = &self.data[self.offset..];
        let frame_len = match read_frame_len(rest) {
            Some(len) => len,
            None => return self.fail("truncated header"),
        };

        if frame_len < ADTS_HEADER_LEN {
            return self.fail("frame length shorter than header");
        }
        if frame_len > rest.len() {
            return self.fail("frame length exceeds payload");
        }

        let frame = self.data.slice(self.offset..self.offset + frame_len);
        self.offset += frame_len;
        Some(Ok(frame))
    }
}

impl std::iter::FusedIterator for Frames {}

/// 세그먼트 페이로드 분할 (지연 평가)
pub fn split(data: Bytes) -> Frames {
    Frames::new(data)
}

/// 세그먼트 페이로드를 전부 분할. 하나라도 손상되면 전체를 거부.
pub fn split_all(data: Bytes) -> Result<Vec<Bytes>> {
    split(data).collect()
}

/// 샘플링 레이트에 해당하는 ADTS 주파수 인덱스 (목록에 없으면 15)
pub fn sampling_frequency_index(sampling_rate: u32) -> u8 {
    SAMPLING_FREQUENCIES
        .iter()
        .position(|&f| f == sampling_rate)
        .map(|i| i as u8)
        .unwrap_or(15)
}

/// AAC-LC 모노 ADTS 헤더 생성 (보호 비트 없음)
///
/// `frame_len`은 헤더를 포함한 전체 프레임 길이
pub fn adts_header(frame_len: usize, sampling_rate: u32) -> Result<[u8; ADTS_HEADER_LEN]> {
    if !(ADTS_HEADER_LEN..=MAX_FRAME_LEN).contains(&frame_len) {
        return Err(Error::MalformedFrame {
            offset: 0,
            reason: "frame length out of range",
        });
    }

    let profile: u8 = 1; // AAC LC (object type 2)
    let sf_index = sampling_frequency_index(sampling_rate);
    let channel_config: u8 = 1;
    let len = frame_len as u16;

    Ok([
        0xFF,
        0xF1,
        (profile << 6) | (sf_index << 2) | ((channel_config >> 2) & 0x01),
        ((channel_config & 0x03) << 6) | ((len >> 11) as u8 & 0x03),
        ((len >> 3) & 0xFF) as u8,
        (((len & 0x07) as u8) << 5) | 0x1F,
        0xFC,
    ])
}

/// 페이로드 앞에 ADTS 헤더를 붙여 프레임 생성
pub fn build_frame(payload: &[u8], sampling_rate: u32) -> Result<Bytes> {
    let frame_len = ADTS_HEADER_LEN + payload.len();
    let header = adts_header(frame_len, sampling_rate)?;

    let mut buf = BytesMut::with_capacity(frame_len);
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(frames: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::new();
        for f in frames {
            buf.put_slice(f);
        }
        buf.freeze()
    }

    #[test]
    fn test_two_frames_15_and_20() {
        let a = build_frame(&[0xAA; 8], 8000).unwrap();
        let b = build_frame(&[0xBB; 13], 8000).unwrap();
        assert_eq!(a.len(), 15);
        assert_eq!(b.len(), 20);

        let payload = concat(&[a.clone(), b.clone()]);
        assert_eq!(payload.len(), 35);

        let frames = split_all(payload).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], a);
        assert_eq!(frames[1], b);
    }

    #[test]
    fn test_length_field_layout() {
        // 13비트 최대값이 3바이트에 걸쳐 기록되는지 확인
        let header = adts_header(MAX_FRAME_LEN, 44100).unwrap();
        assert_eq!(read_frame_len(&header), Some(MAX_FRAME_LEN));
        assert_eq!(header[3] & 0x03, 0x03);
        assert_eq!(header[4], 0xFF);
        assert_eq!(header[5] >> 5, 0x07);
        assert_eq!(sampling_frequency_index(44100), 4);
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(split(Bytes::new()).count(), 0);
    }

    #[test]
    fn test_restartable() {
        let payload = concat(&[
            build_frame(&[1; 3], 8000).unwrap(),
            build_frame(&[2; 4], 8000).unwrap(),
            build_frame(&[3; 5], 8000).unwrap(),
        ]);

        let mut frames = split(payload);
        let copy = frames.clone();
        assert_eq!(frames.by_ref().count(), 3);
        assert!(frames.next().is_none());

        frames.restart();
        assert_eq!(frames.count(), 3);
        assert_eq!(copy.count(), 3);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let good = build_frame(&[7; 10], 8000).unwrap();
        let cut = build_frame(&[8; 10], 8000).unwrap().slice(..12);
        let payload = concat(&[good.clone(), cut]);

        let mut frames = split(payload.clone());
        assert_eq!(frames.next().unwrap().unwrap(), good);
        assert!(matches!(
            frames.next(),
            Some(Err(Error::MalformedFrame { offset: 17, .. }))
        ));
        assert!(frames.next().is_none());

        assert!(split_all(payload).is_err());
    }

    #[test]
    fn test_zero_length_field_does_not_loop() {
        let payload = Bytes::from_static(&[0xFF, 0xF1, 0x50, 0x40, 0x00, 0x1F, 0xFC, 0x00]);
        let items: Vec<_> = split(payload).collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_frame_length_bounds() {
        assert!(adts_header(6, 8000).is_err());
        assert!(adts_header(MAX_FRAME_LEN + 1, 8000).is_err());
        assert!(build_frame(&[0; MAX_FRAME_LEN], 8000).is_err());
    }
}
