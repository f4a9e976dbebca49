//! 엔진이 사용하는 SCP 명령 테이블
//!
//! 명령별 인자 인코딩은 여기에만 둔다. 파이프라인은 `ScpRequest` 만 안다.

use bytes::Bytes;

use crate::cores::{CoreSubset, CpuState};
use crate::error::{Error, Result};
use crate::scp::{ScpCommand, ScpRequest, ScpResponse, ScpResult, SdpFlag, SdpHeader};
use crate::UDP_MESSAGE_MAX_SIZE;

/// 모든 칩을 뜻하는 목적지 좌표
pub const ALL_CHIPS: (u8, u8) = (255, 255);

/// 카운트 응답은 P2P 무응답도 정상 결과로 본다
const COUNT_ACCEPTED: &[ScpResult] = &[ScpResult::Ok, ScpResult::P2pNoReply];

// ═══════════════════════════════════════════════════════════════════════════════
// 메모리 읽기/쓰기
// ═══════════════════════════════════════════════════════════════════════════════

/// 메모리 접근 단위 (CMD_READ/CMD_WRITE 세 번째 인자)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReadType {
    Byte = 0,
    HalfWord = 1,
    Word = 2,
}

impl ReadType {
    /// 주소/길이 정렬에 맞는 접근 단위
    pub fn for_access(base_address: u32, size: usize) -> Self {
        match (base_address % 4, size % 4) {
            (0, 0) => ReadType::Word,
            (0, 2) | (2, 0) | (2, 2) => ReadType::HalfWord,
            _ => ReadType::Byte,
        }
    }
}

fn check_length(parameter: &str, size: usize) -> Result<()> {
    if size == 0 || size > UDP_MESSAGE_MAX_SIZE {
        return Err(Error::invalid_parameter(
            parameter,
            size,
            format!("1..={} 바이트여야 함", UDP_MESSAGE_MAX_SIZE),
        ));
    }
    Ok(())
}

/// `base_address` 부터 `n_bytes` 가 32비트 주소 공간 안에 들어가는지
pub fn check_address_range(base_address: u32, n_bytes: usize) -> Result<()> {
    let end = u64::from(base_address) + n_bytes as u64;
    if end > 1 << 32 {
        return Err(Error::invalid_parameter(
            "base_address",
            format!("0x{:08x}", base_address),
            format!("{} 바이트가 주소 공간 끝을 넘음", n_bytes),
        ));
    }
    Ok(())
}

/// 메모리 읽기 요청 (최대 256 바이트)
pub fn read_memory(x: u8, y: u8, cpu: u8, base_address: u32, size: usize) -> Result<ScpRequest> {
    check_length("size", size)?;
    check_address_range(base_address, size)?;
    let read_type = ReadType::for_access(base_address, size);
    Ok(ScpRequest::new(
        SdpHeader::to_core(x, y, cpu, SdpFlag::ReplyExpected),
        ScpCommand::Read,
        [base_address, size as u32, read_type as u32],
    )
    .with_operation("read memory"))
}

/// 메모리 쓰기 요청 (최대 256 바이트)
pub fn write_memory(x: u8, y: u8, cpu: u8, base_address: u32, data: Bytes) -> Result<ScpRequest> {
    check_length("data", data.len())?;
    check_address_range(base_address, data.len())?;
    let read_type = ReadType::for_access(base_address, data.len());
    Ok(ScpRequest::new(
        SdpHeader::to_core(x, y, cpu, SdpFlag::ReplyExpected),
        ScpCommand::Write,
        [base_address, data.len() as u32, read_type as u32],
    )
    .with_data(data)
    .with_operation("write memory"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// 애플리케이션 실행 / 상태 카운트
// ═══════════════════════════════════════════════════════════════════════════════

fn check_app_id(app_id: u8) -> Result<()> {
    if app_id == 0 {
        return Err(Error::invalid_parameter("app_id", app_id, "0 은 시스템 예약"));
    }
    Ok(())
}

/// 칩의 지정 프로세서에서 적재된 프로그램 실행
pub fn application_run(app_id: u8, subset: &CoreSubset, wait: bool) -> Result<ScpRequest> {
    check_app_id(app_id)?;
    if subset.processors().any(|p| p == 0 || p > 17) {
        return Err(Error::invalid_parameter(
            "processors",
            subset,
            "프로세서는 1..=17 이어야 함",
        ));
    }
    let mut arg1 = subset.processor_mask() | ((app_id as u32) << 24);
    if wait {
        arg1 |= 1 << 18;
    }
    Ok(ScpRequest::new(
        SdpHeader::to_monitor(subset.x(), subset.y(), SdpFlag::ReplyExpected),
        ScpCommand::Ar,
        [arg1, 0, 0],
    )
    .with_operation("application run"))
}

/// 애플리케이션의 특정 상태 코어 수 세기
pub fn count_state(app_id: u8, state: CpuState) -> Result<ScpRequest> {
    check_app_id(app_id)?;
    // 신호 종류 1 = 카운트, 앱 마스크 0xFF, 연산 "합", 모드 "상태"
    let arg2 = ((0xFF << 8) | app_id as u32) + (1 << 22) + (2 << 20) + ((state as u32) << 16);
    Ok(ScpRequest::new(
        SdpHeader::to_monitor(0, 0, SdpFlag::ReplyExpected),
        ScpCommand::Sig,
        [1, arg2, 0x0000_FFFF],
    )
    .with_operation("count state")
    .with_accepted_results(COUNT_ACCEPTED))
}

/// 상태 카운트 응답 해석
pub fn parse_count(response: &ScpResponse) -> Result<u32> {
    response.first_word()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Flood fill
// ═══════════════════════════════════════════════════════════════════════════════

/// 특정 칩 하나만 대상으로 하는 flood fill 마스크
fn chip_flood_mask(x: u8, y: u8) -> u32 {
    let x = x as u32;
    let y = y as u32;
    ((x & 0xFC) << 24) + ((y & 0xFC) << 16) + (3 << 16) + (1 << ((y & 3) * 4 + (x & 3)))
}

/// Flood fill 시작 (n_blocks 예고)
///
/// `chip` 이 있으면 그 칩만, 없으면 모든 칩이 대상이다.
pub fn flood_fill_start(nn_id: u8, n_blocks: u8, chip: Option<(u8, u8)>) -> ScpRequest {
    let key = (6 << 24) | ((nn_id as u32) << 16) | ((n_blocks as u32) << 8);
    let data = match chip {
        Some((x, y)) => chip_flood_mask(x, y),
        None => 0xFFFF,
    };
    // 전달 링크 0x3f, 재시도 0x1A, 전달 플래그 bit 31
    let arg3 = (1 << 31) | (0x3F << 8) | 0x1A;
    ScpRequest::new(
        SdpHeader::to_monitor(ALL_CHIPS.0, ALL_CHIPS.1, SdpFlag::ReplyExpected),
        ScpCommand::Nnp,
        [key, data, arg3],
    )
    .with_operation("flood fill start")
}

/// Flood fill 데이터 블록
pub fn flood_fill_data(nn_id: u8, block_no: u8, base_address: u32, data: Bytes) -> Result<ScpRequest> {
    check_length("data", data.len())?;
    let words = (data.len() + 3) / 4;
    let arg1 = (0x3F << 24) | (0x1E << 16) | nn_id as u32;
    let arg2 = ((block_no as u32) << 16) | (((words - 1) as u32) << 8);
    Ok(ScpRequest::new(
        SdpHeader::to_monitor(ALL_CHIPS.0, ALL_CHIPS.1, SdpFlag::ReplyExpected),
        ScpCommand::Ffd,
        [arg1, arg2, base_address],
    )
    .with_data(data)
    .with_operation("flood fill data"))
}

/// Flood fill 종료; 프로세서가 있으면 적재 후 바로 실행
pub fn flood_fill_end(nn_id: u8, app_id: u8, processors: u32, wait: bool) -> ScpRequest {
    let key = (15 << 24) | nn_id as u32;
    let mut data = ((app_id as u32) << 24) | processors;
    if wait {
        data |= 1 << 18;
    }
    ScpRequest::new(
        SdpHeader::to_monitor(ALL_CHIPS.0, ALL_CHIPS.1, SdpFlag::ReplyExpected),
        ScpCommand::Nnp,
        [key, data, (0x3F << 8) | 0x1A],
    )
    .with_operation("flood fill end")
}

/// NNP 요청에서 nearest-neighbour id 추출
pub fn nn_id_of(request: &ScpRequest) -> u8 {
    match (request.command, request.arg1 >> 24) {
        (ScpCommand::Nnp, 6) => ((request.arg1 >> 16) & 0xFF) as u8,
        _ => (request.arg1 & 0xFF) as u8,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 버전
// ═══════════════════════════════════════════════════════════════════════════════

/// 코어의 소프트웨어 버전 요청
pub fn get_version(x: u8, y: u8, cpu: u8) -> ScpRequest {
    ScpRequest::new(
        SdpHeader::to_core(x, y, cpu, SdpFlag::ReplyExpected),
        ScpCommand::Ver,
        [0, 0, 0],
    )
    .with_operation("get version")
}

/// 버전 응답 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub physical_cpu_id: u8,
    pub name: String,
    pub hardware: String,
    pub version_number: (u32, u32, u32),
    pub build_date: u32,
}

impl VersionInfo {
    /// 응답 데이터 해석
    ///
    /// `p, phys, y, x, 0(u16), version(u16), build_date(u32)` 뒤에 문자열이 온다.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 13 {
            return Err(Error::InvalidPacket {
                packet_type: "version".into(),
                problem: format!("길이 {} < 13", data.len()),
            });
        }
        let version_no = u16::from_le_bytes([data[6], data[7]]);
        let build_date = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let text = String::from_utf8_lossy(&data[12..data.len() - 1]).into_owned();

        let bad = |problem: &str| {
            Error::invalid_parameter("version_data", text.clone(), problem.to_string())
        };

        let (name_hardware, version_number) = if version_no < 0xFFFF {
            let number = version_no as u32;
            (text.clone(), (number / 100, number % 100, 0))
        } else {
            let (name_hardware, version) = text.split_once('\0').ok_or_else(|| bad("NUL 구분자 없음"))?;
            let mut parts = version.trim_end_matches('\0').splitn(3, '.').map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse::<u32>()
            });
            let mut next = || parts.next().and_then(|p| p.ok()).ok_or_else(|| bad("버전 형식 오류"));
            let number = (next()?, next()?, next()?);
            (name_hardware.trim_end_matches('\0').to_string(), number)
        };

        let (name, hardware) = name_hardware
            .split_once('/')
            .ok_or_else(|| bad("이름/하드웨어 형식 오류"))?;

        Ok(Self {
            p: data[0],
            physical_cpu_id: data[1],
            y: data[2],
            x: data[3],
            name: name.to_string(),
            hardware: hardware.to_string(),
            version_number,
            build_date,
        })
    }

    /// 보드 측 응답 데이터 생성
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![self.p, self.physical_cpu_id, self.y, self.x, 0, 0, 0xFF, 0xFF];
        data.extend_from_slice(&self.build_date.to_le_bytes());
        data.extend_from_slice(format!("{}/{}", self.name, self.hardware).as_bytes());
        data.push(0);
        let (major, minor, patch) = self.version_number;
        data.extend_from_slice(format!("{}.{}.{}", major, minor, patch).as_bytes());
        data.push(0);
        data
    }
}
