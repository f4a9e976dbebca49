//! SDP/SCP 메시지 코덱
//!
//! 요청 데이터그램 (리틀 엔디언):
//! ```text
//! | pad(2) | SDP(8) | command(2) | sequence(2) | arg1..arg3(12) | payload(<=256) |
//! ```
//! 응답은 같은 위치(오프셋 10)에 command 대신 result 코드를 싣는다.

use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::{DEFAULT_SDP_TAG, UDP_MESSAGE_MAX_SIZE};

/// 데이터그램 앞 패딩 길이
pub const PAD_LENGTH: usize = 2;

/// SDP 헤더 길이
pub const SDP_HEADER_LENGTH: usize = 8;

/// SCP 요청 헤더 길이 (command + sequence + 인자 3개)
pub const SCP_REQUEST_HEADER_LENGTH: usize = 16;

/// 응답 데이터그램에서 result/sequence 위치
pub const RESULT_OFFSET: usize = PAD_LENGTH + SDP_HEADER_LENGTH;

/// 응답 데이터그램에서 명령별 데이터 시작 위치
pub const RESPONSE_DATA_OFFSET: usize = PAD_LENGTH + SDP_HEADER_LENGTH + 4;

/// 호스트 측 SDP 기본 포트
pub const DEFAULT_SOURCE_PORT: u8 = 7;

/// 호스트 측 SDP 기본 CPU
pub const DEFAULT_SOURCE_CPU: u8 = 31;

// ═══════════════════════════════════════════════════════════════════════════════
// SDP 헤더
// ═══════════════════════════════════════════════════════════════════════════════

/// SDP 플래그
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdpFlag {
    ReplyNotExpected = 0x07,
    ReplyNotExpectedNoP2p = 0x27,
    ReplyExpected = 0x87,
    ReplyExpectedNoP2p = 0xA7,
}

impl SdpFlag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x07 => Some(SdpFlag::ReplyNotExpected),
            0x27 => Some(SdpFlag::ReplyNotExpectedNoP2p),
            0x87 => Some(SdpFlag::ReplyExpected),
            0xA7 => Some(SdpFlag::ReplyExpectedNoP2p),
            _ => None,
        }
    }

    /// 응답을 기대하는 플래그인지
    pub fn expects_reply(self) -> bool {
        (self as u8) & 0x80 != 0
    }
}

/// SDP 헤더
///
/// `None` 인 필드는 인코딩 시 기본값으로 채워진다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpHeader {
    pub flags: SdpFlag,
    pub tag: Option<u8>,
    pub destination_port: u8,
    pub destination_cpu: u8,
    pub destination_chip_x: u8,
    pub destination_chip_y: u8,
    pub source_port: Option<u8>,
    pub source_cpu: Option<u8>,
    pub source_chip_x: Option<u8>,
    pub source_chip_y: Option<u8>,
}

impl SdpHeader {
    /// 칩의 모니터 프로세서 (포트 0, CPU 0) 를 향하는 헤더
    pub fn to_monitor(x: u8, y: u8, flags: SdpFlag) -> Self {
        Self::to_core(x, y, 0, flags)
    }

    /// 특정 코어를 향하는 헤더
    pub fn to_core(x: u8, y: u8, cpu: u8, flags: SdpFlag) -> Self {
        Self {
            flags,
            tag: None,
            destination_port: 0,
            destination_cpu: cpu,
            destination_chip_x: x,
            destination_chip_y: y,
            source_port: None,
            source_cpu: None,
            source_chip_x: None,
            source_chip_y: None,
        }
    }

    /// 명시된 송신 측 포트/CPU 가 호스트 기본값과 다르면 에러
    pub fn validate(&self) -> Result<()> {
        if let Some(port) = self.source_port {
            if port != DEFAULT_SOURCE_PORT {
                return Err(Error::invalid_parameter(
                    "sdp_header.source_port",
                    port,
                    format!("호스트 송신 포트는 {} 이어야 함", DEFAULT_SOURCE_PORT),
                ));
            }
        }
        if let Some(cpu) = self.source_cpu {
            if cpu != DEFAULT_SOURCE_CPU {
                return Err(Error::invalid_parameter(
                    "sdp_header.source_cpu",
                    cpu,
                    format!("호스트 송신 CPU 는 {} 이어야 함", DEFAULT_SOURCE_CPU),
                ));
            }
        }
        if self.destination_port > 7 {
            return Err(Error::invalid_parameter(
                "sdp_header.destination_port",
                self.destination_port,
                "포트는 3비트",
            ));
        }
        if self.destination_cpu > 31 {
            return Err(Error::invalid_parameter(
                "sdp_header.destination_cpu",
                self.destination_cpu,
                "CPU 는 5비트",
            ));
        }
        Ok(())
    }

    /// 기본값을 채워 8바이트로 기록
    pub fn encode_into(&self, buf: &mut BytesMut, default_tag: u8) {
        let source_port = self.source_port.unwrap_or(DEFAULT_SOURCE_PORT);
        let source_cpu = self.source_cpu.unwrap_or(DEFAULT_SOURCE_CPU);
        buf.put_u8(self.flags as u8);
        buf.put_u8(self.tag.unwrap_or(default_tag));
        buf.put_u8(((self.destination_port & 0x7) << 5) | (self.destination_cpu & 0x1F));
        buf.put_u8(((source_port & 0x7) << 5) | (source_cpu & 0x1F));
        buf.put_u8(self.destination_chip_y);
        buf.put_u8(self.destination_chip_x);
        buf.put_u8(self.source_chip_y.unwrap_or(0));
        buf.put_u8(self.source_chip_x.unwrap_or(0));
    }

    /// 8바이트에서 복원 (모든 필드가 채워진 상태)
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SDP_HEADER_LENGTH {
            return Err(Error::InvalidPacket {
                packet_type: "SDP".into(),
                problem: format!("헤더 길이 부족: {}", bytes.len()),
            });
        }
        let flags = SdpFlag::from_u8(bytes[0]).ok_or_else(|| Error::InvalidPacket {
            packet_type: "SDP".into(),
            problem: format!("알 수 없는 플래그 0x{:02x}", bytes[0]),
        })?;
        Ok(Self {
            flags,
            tag: Some(bytes[1]),
            destination_port: bytes[2] >> 5,
            destination_cpu: bytes[2] & 0x1F,
            source_port: Some(bytes[3] >> 5),
            source_cpu: Some(bytes[3] & 0x1F),
            destination_chip_y: bytes[4],
            destination_chip_x: bytes[5],
            source_chip_y: Some(bytes[6]),
            source_chip_x: Some(bytes[7]),
        })
    }

    /// 송/수신 측을 뒤바꾼 응답용 헤더
    pub fn reply(&self) -> Self {
        Self {
            flags: SdpFlag::ReplyNotExpected,
            tag: self.tag,
            destination_port: self.source_port.unwrap_or(DEFAULT_SOURCE_PORT),
            destination_cpu: self.source_cpu.unwrap_or(DEFAULT_SOURCE_CPU),
            destination_chip_x: self.source_chip_x.unwrap_or(0),
            destination_chip_y: self.source_chip_y.unwrap_or(0),
            source_port: Some(self.destination_port),
            source_cpu: Some(self.destination_cpu),
            source_chip_x: Some(self.destination_chip_x),
            source_chip_y: Some(self.destination_chip_y),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 명령 / 결과 코드
// ═══════════════════════════════════════════════════════════════════════════════

/// SCP 명령 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ScpCommand {
    Ver = 0,
    Run = 1,
    Read = 2,
    Write = 3,
    Aplx = 4,
    Fill = 5,
    Count = 15,
    Remap = 16,
    LinkRead = 17,
    LinkWrite = 18,
    Ar = 19,
    Nnp = 20,
    AppCopyRun = 21,
    Sig = 22,
    Ffd = 23,
    As = 24,
    Led = 25,
    IpTag = 26,
    Srom = 27,
    Alloc = 28,
    Rtr = 29,
    Dpri = 30,
    Info = 31,
    Sync = 32,
    BmpInfo = 48,
    FlashCopy = 49,
    FlashErase = 50,
    FlashWrite = 51,
    Reset = 55,
    BmpPower = 57,
    Tube = 64,
}

impl ScpCommand {
    pub fn from_u16(value: u16) -> Option<Self> {
        use ScpCommand::*;
        let command = match value {
            0 => Ver,
            1 => Run,
            2 => Read,
            3 => Write,
            4 => Aplx,
            5 => Fill,
            15 => Count,
            16 => Remap,
            17 => LinkRead,
            18 => LinkWrite,
            19 => Ar,
            20 => Nnp,
            21 => AppCopyRun,
            22 => Sig,
            23 => Ffd,
            24 => As,
            25 => Led,
            26 => IpTag,
            27 => Srom,
            28 => Alloc,
            29 => Rtr,
            30 => Dpri,
            31 => Info,
            32 => Sync,
            48 => BmpInfo,
            49 => FlashCopy,
            50 => FlashErase,
            51 => FlashWrite,
            55 => Reset,
            57 => BmpPower,
            64 => Tube,
            _ => return None,
        };
        Some(command)
    }
}

/// SCP 결과 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ScpResult {
    Ok = 0x80,
    Len = 0x81,
    Sum = 0x82,
    Cmd = 0x83,
    Arg = 0x84,
    Port = 0x85,
    Timeout = 0x86,
    Route = 0x87,
    Cpu = 0x88,
    Dead = 0x89,
    Buf = 0x8A,
    P2pNoReply = 0x8B,
    P2pReject = 0x8C,
    P2pBusy = 0x8D,
    P2pTimeout = 0x8E,
    PktTx = 0x8F,
}

impl ScpResult {
    pub fn from_u16(value: u16) -> Option<Self> {
        use ScpResult::*;
        let result = match value {
            0x80 => Ok,
            0x81 => Len,
            0x82 => Sum,
            0x83 => Cmd,
            0x84 => Arg,
            0x85 => Port,
            0x86 => Timeout,
            0x87 => Route,
            0x88 => Cpu,
            0x89 => Dead,
            0x8A => Buf,
            0x8B => P2pNoReply,
            0x8C => P2pReject,
            0x8D => P2pBusy,
            0x8E => P2pTimeout,
            0x8F => PktTx,
            _ => return None,
        };
        Some(result)
    }

    /// 잠시 후 같은 요청을 다시 보내야 하는 결과 코드
    pub fn is_retry_code(self) -> bool {
        matches!(
            self,
            ScpResult::Timeout | ScpResult::P2pTimeout | ScpResult::Len | ScpResult::P2pNoReply
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 요청
// ═══════════════════════════════════════════════════════════════════════════════

/// SCP 요청
#[derive(Debug, Clone)]
pub struct ScpRequest {
    pub sdp_header: SdpHeader,
    pub command: ScpCommand,
    /// `None` 이면 송신 시 프로세스가 할당
    pub sequence: Option<u16>,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
    pub data: Bytes,
    /// 에러 보고용 동작 이름
    pub operation: &'static str,
    /// 성공으로 취급할 결과 코드
    pub accepted_results: &'static [ScpResult],
}

impl ScpRequest {
    /// 새 요청 생성 (결과 코드는 RC_OK 만 허용)
    pub fn new(sdp_header: SdpHeader, command: ScpCommand, args: [u32; 3]) -> Self {
        Self {
            sdp_header,
            command,
            sequence: None,
            arg1: args[0],
            arg2: args[1],
            arg3: args[2],
            data: Bytes::new(),
            operation: "SCP request",
            accepted_results: &[ScpResult::Ok],
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_accepted_results(mut self, accepted: &'static [ScpResult]) -> Self {
        self.accepted_results = accepted;
        self
    }

    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// 결과 코드가 이 요청에서 성공인지
    pub fn accepts(&self, result: ScpResult) -> bool {
        self.accepted_results.contains(&result)
    }

    /// 네트워크 송신 전에 잡을 수 있는 오류 검사
    pub fn validate(&self) -> Result<()> {
        self.sdp_header.validate()?;
        if self.data.len() > UDP_MESSAGE_MAX_SIZE {
            return Err(Error::invalid_parameter(
                "data",
                self.data.len(),
                format!("페이로드는 최대 {} 바이트", UDP_MESSAGE_MAX_SIZE),
            ));
        }
        Ok(())
    }

    /// 기본 태그로 인코딩
    pub fn to_bytes(&self) -> Result<Bytes> {
        self.encode(DEFAULT_SDP_TAG)
    }

    /// 데이터그램으로 인코딩
    ///
    /// 시퀀스가 비어 있으면 0 으로 기록한다.
    pub fn encode(&self, default_tag: u8) -> Result<Bytes> {
        self.validate()?;
        let mut buf = BytesMut::with_capacity(
            PAD_LENGTH + SDP_HEADER_LENGTH + SCP_REQUEST_HEADER_LENGTH + self.data.len(),
        );
        buf.put_bytes(0, PAD_LENGTH);
        self.sdp_header.encode_into(&mut buf, default_tag);
        buf.put_u16_le(self.command as u16);
        buf.put_u16_le(self.sequence.unwrap_or(0));
        buf.put_u32_le(self.arg1);
        buf.put_u32_le(self.arg2);
        buf.put_u32_le(self.arg3);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// 데이터그램에서 요청 복원 (보드 측)
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let min_len = PAD_LENGTH + SDP_HEADER_LENGTH + SCP_REQUEST_HEADER_LENGTH;
        if datagram.len() < min_len {
            return Err(Error::InvalidPacket {
                packet_type: "SCP request".into(),
                problem: format!("길이 {} < {}", datagram.len(), min_len),
            });
        }
        let sdp_header = SdpHeader::decode(&datagram[PAD_LENGTH..])?;
        let mut cursor = &datagram[RESULT_OFFSET..];
        let raw_command = cursor.get_u16_le();
        let command = ScpCommand::from_u16(raw_command).ok_or_else(|| Error::InvalidPacket {
            packet_type: "SCP request".into(),
            problem: format!("알 수 없는 명령 {}", raw_command),
        })?;
        let sequence = cursor.get_u16_le();
        let arg1 = cursor.get_u32_le();
        let arg2 = cursor.get_u32_le();
        let arg3 = cursor.get_u32_le();
        Ok(Self {
            sdp_header,
            command,
            sequence: Some(sequence),
            arg1,
            arg2,
            arg3,
            data: Bytes::copy_from_slice(cursor),
            operation: "SCP request",
            accepted_results: &[ScpResult::Ok],
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 응답
// ═══════════════════════════════════════════════════════════════════════════════

/// SCP 응답
#[derive(Debug, Clone)]
pub struct ScpResponse {
    pub sdp_header: SdpHeader,
    pub result: ScpResult,
    pub sequence: u16,
    /// 수신한 데이터그램 전체
    pub datagram: Bytes,
    /// SDP 헤더가 시작하는 위치
    pub offset: usize,
}

impl ScpResponse {
    /// 헤더 해석 없이 (결과 코드 원값, 시퀀스) 만 읽기
    pub fn peek(datagram: &[u8]) -> Result<(u16, u16)> {
        if datagram.len() < RESPONSE_DATA_OFFSET {
            return Err(Error::InvalidPacket {
                packet_type: "SCP response".into(),
                problem: format!("길이 {} < {}", datagram.len(), RESPONSE_DATA_OFFSET),
            });
        }
        let mut cursor = &datagram[RESULT_OFFSET..RESPONSE_DATA_OFFSET];
        let raw_result = cursor.get_u16_le();
        let sequence = cursor.get_u16_le();
        Ok((raw_result, sequence))
    }

    /// 수신 데이터그램 해석
    ///
    /// 알 수 없는 결과 코드는 `InvalidPacket`; 시퀀스는 [`ScpResponse::peek`] 로 얻을 수 있다.
    pub fn decode(datagram: Bytes) -> Result<Self> {
        let (raw_result, sequence) = Self::peek(&datagram)?;
        let sdp_header = SdpHeader::decode(&datagram[PAD_LENGTH..])?;
        let result = ScpResult::from_u16(raw_result).ok_or_else(|| Error::InvalidPacket {
            packet_type: "SCP response".into(),
            problem: format!("알 수 없는 결과 코드 0x{:x}", raw_result),
        })?;
        Ok(Self {
            sdp_header,
            result,
            sequence,
            datagram,
            offset: PAD_LENGTH,
        })
    }

    /// result/sequence 뒤 명령별 데이터
    pub fn payload(&self) -> &[u8] {
        &self.datagram[RESPONSE_DATA_OFFSET..]
    }

    /// 명령별 데이터 첫 워드
    pub fn first_word(&self) -> Result<u32> {
        let mut payload = self.payload();
        if payload.len() < 4 {
            return Err(Error::InvalidPacket {
                packet_type: "SCP response".into(),
                problem: "데이터 워드 없음".into(),
            });
        }
        Ok(payload.get_u32_le())
    }

    /// 응답 데이터그램 생성 (보드 측)
    pub fn encode(sdp_header: &SdpHeader, result: ScpResult, sequence: u16, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_DATA_OFFSET + data.len());
        buf.put_bytes(0, PAD_LENGTH);
        sdp_header.encode_into(&mut buf, DEFAULT_SDP_TAG);
        buf.put_u16_le(result as u16);
        buf.put_u16_le(sequence);
        buf.put_slice(data);
        buf.freeze()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 시퀀스 번호
// ═══════════════════════════════════════════════════════════════════════════════

/// `n` 다음 시퀀스 번호
pub fn next_sequence(n: u16) -> u16 {
    n.wrapping_add(1)
}

/// 시퀀스 번호 발급기
///
/// 여러 프로세스가 공유할 수 있다. 미해결 요청과의 충돌은 파이프라인이 건너뛴다.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicU16,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u16) -> Self {
        Self {
            next: AtomicU16::new(first),
        }
    }

    /// 현재 값을 돌려주고 다음 값으로 이동
    pub fn next(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_request() -> ScpRequest {
        ScpRequest::new(
            SdpHeader::to_monitor(3, 5, SdpFlag::ReplyExpected),
            ScpCommand::Read,
            [0x6000_0000, 256, 2],
        )
        .with_sequence(0x1234)
    }

    #[test]
    fn test_request_layout() {
        let bytes = read_request().to_bytes().unwrap();
        assert_eq!(bytes.len(), 26);
        assert_eq!(&bytes[0..2], &[0, 0]);
        // flags, tag, dest port/cpu, src port/cpu, dest y, dest x, src y, src x
        assert_eq!(&bytes[2..10], &[0x87, 0xFF, 0x00, 0xFF, 5, 3, 0, 0]);
        assert_eq!(&bytes[10..12], &[2, 0]);
        assert_eq!(&bytes[12..14], &[0x34, 0x12]);
        assert_eq!(&bytes[14..18], &[0, 0, 0, 0x60]);
        assert_eq!(&bytes[18..22], &[0, 1, 0, 0]);
    }

    #[test]
    fn test_request_decode_keeps_payload() {
        let request = read_request().with_data(Bytes::from_static(b"abcd"));
        let decoded = ScpRequest::decode(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.command, ScpCommand::Read);
        assert_eq!(decoded.sequence, Some(0x1234));
        assert_eq!(decoded.arg1, 0x6000_0000);
        assert_eq!(&decoded.data[..], b"abcd");
        assert_eq!(decoded.sdp_header.source_port, Some(DEFAULT_SOURCE_PORT));
    }

    #[test]
    fn test_explicit_source_rejected() {
        let mut request = read_request();
        request.sdp_header.source_port = Some(3);
        assert!(matches!(
            request.to_bytes(),
            Err(Error::InvalidParameter { .. })
        ));

        let mut request = read_request();
        request.sdp_header.source_cpu = Some(DEFAULT_SOURCE_CPU);
        assert!(request.to_bytes().is_ok());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let request = read_request().with_data(Bytes::from(vec![0u8; UDP_MESSAGE_MAX_SIZE + 1]));
        assert!(matches!(
            request.validate(),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_response_decode() {
        let header = SdpHeader::to_monitor(3, 5, SdpFlag::ReplyExpected).reply();
        let datagram = ScpResponse::encode(&header, ScpResult::Ok, 77, &42u32.to_le_bytes());
        let response = ScpResponse::decode(datagram).unwrap();
        assert_eq!(response.result, ScpResult::Ok);
        assert_eq!(response.sequence, 77);
        assert_eq!(response.offset, PAD_LENGTH);
        assert_eq!(response.first_word().unwrap(), 42);
        assert_eq!(response.sdp_header.source_chip_x, Some(3));
    }

    #[test]
    fn test_response_too_short() {
        let result = ScpResponse::decode(Bytes::from_static(&[0u8; 12]));
        assert!(matches!(result, Err(Error::InvalidPacket { .. })));
        assert!(ScpResponse::peek(&[0u8; 12]).is_err());
    }

    #[test]
    fn test_unknown_result_code_still_peeks() {
        let header = SdpHeader::to_monitor(0, 0, SdpFlag::ReplyExpected).reply();
        let mut datagram = ScpResponse::encode(&header, ScpResult::Ok, 300, &[]).to_vec();
        datagram[RESULT_OFFSET..RESULT_OFFSET + 2].copy_from_slice(&0x9Au16.to_le_bytes());

        assert_eq!(ScpResponse::peek(&datagram).unwrap(), (0x9A, 300));
        assert!(matches!(
            ScpResponse::decode(Bytes::from(datagram)),
            Err(Error::InvalidPacket { .. })
        ));
    }

    #[test]
    fn test_next_sequence_wraps() {
        for n in [0u16, 1, 1000, 65534, 65535] {
            assert_eq!(next_sequence(n) as u32, (n as u32 + 1) % 65536);
        }

        let generator = SequenceGenerator::starting_at(65535);
        assert_eq!(generator.next(), 65535);
        assert_eq!(generator.next(), 0);
        assert_eq!(generator.next(), 1);
    }

    #[test]
    fn test_retry_codes() {
        assert!(ScpResult::Timeout.is_retry_code());
        assert!(ScpResult::P2pNoReply.is_retry_code());
        assert!(!ScpResult::Ok.is_retry_code());
        assert!(!ScpResult::Arg.is_retry_code());
    }
}
