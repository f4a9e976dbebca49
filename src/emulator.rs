//! 가상 보드 (SCAMP 흉내)
//!
//! 엔진을 실제 하드웨어 없이 끝에서 끝까지 시험하기 위한 UDP 응답기.
//! - 버전 / 메모리 읽기·쓰기 / 애플리케이션 실행 / 상태 카운트
//! - Flood fill 블록 조립 후 모든 대상 칩에 반영
//! - 설정 가능한 요청 손실, 재시도 결과 코드 주입

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::VersionInfo;
use crate::cores::{ChipCoord, CpuState};
use crate::error::Result;
use crate::scp::{ScpCommand, ScpRequest, ScpResponse, ScpResult};
use crate::selector::MachineTopology;

/// 가상 메모리 페이지 크기
const PAGE_SIZE: u32 = 4096;

/// 칩당 코어 수
const CORES_PER_CHIP: u8 = 18;

/// AR / flood END 의 "sync0 에서 대기" 플래그
const WAIT_FLAG: u32 = 1 << 18;

/// 가상 보드 설정
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// 머신 크기
    pub topology: MachineTopology,

    /// 요청을 응답 없이 버릴 확률 (0.0 ~ 1.0)
    pub loss_probability: f64,

    /// 버전 응답에 실을 이름/하드웨어/버전
    pub name: String,
    pub hardware: String,
    pub version: (u32, u32, u32),
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            topology: MachineTopology::new(8, 8),
            loss_probability: 0.0,
            name: "SC&MP".into(),
            hardware: "SpiNNaker".into(),
            version: (4, 0, 0),
        }
    }
}

impl BoardConfig {
    /// 손실 링크 흉내
    pub fn lossy(loss_probability: f64) -> Self {
        Self {
            loss_probability: loss_probability.clamp(0.0, 1.0),
            ..Self::default()
        }
    }
}

/// 보드 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardStats {
    pub received: u64,
    pub dropped: u64,
    pub replied: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// 메모리
// ═══════════════════════════════════════════════════════════════════════════════

/// 페이지 단위 희소 메모리 (쓰지 않은 곳은 0)
#[derive(Debug, Default)]
struct ChipMemory {
    pages: HashMap<u32, Box<[u8]>>,
}

impl ChipMemory {
    fn write(&mut self, address: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let address = address.wrapping_add(i as u32);
            let page = self
                .pages
                .entry(address / PAGE_SIZE)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[(address % PAGE_SIZE) as usize] = *byte;
        }
    }

    fn read(&self, address: u32, length: usize) -> Vec<u8> {
        (0..length)
            .map(|i| {
                let address = address.wrapping_add(i as u32);
                self.pages
                    .get(&(address / PAGE_SIZE))
                    .map_or(0, |page| page[(address % PAGE_SIZE) as usize])
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Flood 조립
// ═══════════════════════════════════════════════════════════════════════════════

/// 진행 중인 flood fill 하나
#[derive(Debug)]
struct FloodTransaction {
    targets: Vec<ChipCoord>,
    /// 블록 번호 -> (주소, 데이터)
    blocks: Vec<Option<(u32, Bytes)>>,
}

impl FloodTransaction {
    fn new(targets: Vec<ChipCoord>, n_blocks: usize) -> Self {
        Self {
            targets,
            blocks: vec![None; n_blocks],
        }
    }

    /// 블록 삽입; 범위 밖이면 false, 중복은 무시
    fn insert(&mut self, block_no: usize, address: u32, data: Bytes) -> bool {
        match self.blocks.get_mut(block_no) {
            Some(slot) => {
                if slot.is_none() {
                    *slot = Some((address, data));
                }
                true
            }
            None => false,
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 보드 상태
// ═══════════════════════════════════════════════════════════════════════════════

/// 보드 내부 상태 (수신 태스크와 검사용 접근자가 공유)
#[derive(Debug)]
struct BoardState {
    config: BoardConfig,
    memory: HashMap<ChipCoord, ChipMemory>,
    /// (칩, 프로세서) -> (app_id, 상태)
    cores: HashMap<(ChipCoord, u8), (u8, CpuState)>,
    floods: HashMap<u8, FloodTransaction>,
    drop_next: usize,
    retry_code_next: usize,
    stats: BoardStats,
}

type Reply = (ScpResult, Vec<u8>);

impl BoardState {
    fn new(config: BoardConfig) -> Self {
        Self {
            config,
            memory: HashMap::new(),
            cores: HashMap::new(),
            floods: HashMap::new(),
            drop_next: 0,
            retry_code_next: 0,
            stats: BoardStats::default(),
        }
    }

    fn on_machine(&self, (x, y): ChipCoord) -> bool {
        x < self.config.topology.width && y < self.config.topology.height
    }

    fn all_chips(&self) -> Vec<ChipCoord> {
        let topology = self.config.topology;
        (0..topology.height)
            .flat_map(|y| (0..topology.width).map(move |x| (x, y)))
            .collect()
    }

    /// 요청 하나 처리; `None` 이면 응답하지 않는다
    fn handle(&mut self, request: &ScpRequest) -> Option<Reply> {
        self.stats.received += 1;

        if self.drop_next > 0 {
            self.drop_next -= 1;
            self.stats.dropped += 1;
            return None;
        }
        let loss = self.config.loss_probability;
        if loss > 0.0 && rand::thread_rng().gen_bool(loss) {
            self.stats.dropped += 1;
            return None;
        }
        self.stats.replied += 1;
        if self.retry_code_next > 0 {
            self.retry_code_next -= 1;
            return Some((ScpResult::Timeout, Vec::new()));
        }

        let header = &request.sdp_header;
        let chip = (header.destination_chip_x, header.destination_chip_y);
        let reply = match request.command {
            ScpCommand::Ver => self.version(chip, header.destination_cpu),
            ScpCommand::Read => self.read(chip, request),
            ScpCommand::Write => self.write(chip, request),
            ScpCommand::Ar => self.application_run(chip, request),
            ScpCommand::Sig => self.count(chip, request),
            ScpCommand::Nnp => self.nearest_neighbour(request),
            ScpCommand::Ffd => self.flood_data(request),
            other => {
                debug!("지원하지 않는 명령: {:?}", other);
                (ScpResult::Cmd, Vec::new())
            }
        };
        Some(reply)
    }

    fn version(&self, chip: ChipCoord, cpu: u8) -> Reply {
        if !self.on_machine(chip) {
            return (ScpResult::Route, Vec::new());
        }
        let info = VersionInfo {
            x: chip.0,
            y: chip.1,
            p: cpu,
            physical_cpu_id: cpu,
            name: self.config.name.clone(),
            hardware: self.config.hardware.clone(),
            version_number: self.config.version,
            build_date: 0,
        };
        (ScpResult::Ok, info.encode())
    }

    fn read(&self, chip: ChipCoord, request: &ScpRequest) -> Reply {
        if !self.on_machine(chip) {
            return (ScpResult::Route, Vec::new());
        }
        let data = match self.memory.get(&chip) {
            Some(memory) => memory.read(request.arg1, request.arg2 as usize),
            None => vec![0; request.arg2 as usize],
        };
        (ScpResult::Ok, data)
    }

    fn write(&mut self, chip: ChipCoord, request: &ScpRequest) -> Reply {
        if !self.on_machine(chip) {
            return (ScpResult::Route, Vec::new());
        }
        let size = (request.arg2 as usize).min(request.data.len());
        self.memory
            .entry(chip)
            .or_default()
            .write(request.arg1, &request.data[..size]);
        (ScpResult::Ok, Vec::new())
    }

    fn start_cores(&mut self, chip: ChipCoord, arg: u32) {
        let app_id = (arg >> 24) as u8;
        let state = if arg & WAIT_FLAG != 0 {
            CpuState::Sync0
        } else {
            CpuState::Running
        };
        for p in 1..CORES_PER_CHIP {
            if arg & (1 << p) != 0 {
                self.cores.insert((chip, p), (app_id, state));
            }
        }
    }

    fn application_run(&mut self, chip: ChipCoord, request: &ScpRequest) -> Reply {
        if !self.on_machine(chip) {
            return (ScpResult::Route, Vec::new());
        }
        self.start_cores(chip, request.arg1);
        (ScpResult::Ok, Vec::new())
    }

    /// 목적지 이더넷 칩의 보드에 속한 코어만 센다
    fn count(&self, chip: ChipCoord, request: &ScpRequest) -> Reply {
        let app_id = (request.arg2 & 0xFF) as u8;
        let Some(state) = CpuState::from_u8(((request.arg2 >> 16) & 0xF) as u8) else {
            return (ScpResult::Arg, Vec::new());
        };
        let topology = self.config.topology;
        let count = self
            .cores
            .iter()
            .filter(|((core_chip, _), (id, s))| {
                *id == app_id
                    && *s == state
                    && topology.nearest_ethernet(core_chip.0, core_chip.1) == Some(chip)
            })
            .count() as u32;
        (ScpResult::Ok, count.to_le_bytes().to_vec())
    }

    fn flood_targets(&self, mask: u32) -> Vec<ChipCoord> {
        if mask & 0xFFFF == 0xFFFF {
            return self.all_chips();
        }
        let bit = (mask & 0xFFFF).trailing_zeros();
        let x = ((mask >> 24) & 0xFC) as u8 | (bit & 3) as u8;
        let y = ((mask >> 16) & 0xFC) as u8 | (bit >> 2) as u8;
        if self.on_machine((x, y)) {
            vec![(x, y)]
        } else {
            Vec::new()
        }
    }

    fn nearest_neighbour(&mut self, request: &ScpRequest) -> Reply {
        match request.arg1 >> 24 {
            // START
            6 => {
                let nn_id = ((request.arg1 >> 16) & 0xFF) as u8;
                let n_blocks = ((request.arg1 >> 8) & 0xFF) as usize;
                let targets = self.flood_targets(request.arg2);
                debug!("flood 시작: nn_id={}, {} 블록, 칩 {}개", nn_id, n_blocks, targets.len());
                self.floods
                    .insert(nn_id, FloodTransaction::new(targets, n_blocks));
                (ScpResult::Ok, Vec::new())
            }
            // END
            15 => {
                let nn_id = (request.arg1 & 0xFF) as u8;
                let Some(flood) = self.floods.remove(&nn_id) else {
                    // 재전송된 END 는 이미 처리됨
                    return (ScpResult::Ok, Vec::new());
                };
                if !flood.is_complete() {
                    warn!("flood 불완전: nn_id={}", nn_id);
                    return (ScpResult::Arg, Vec::new());
                }
                for &chip in &flood.targets {
                    let memory = self.memory.entry(chip).or_default();
                    for (address, data) in flood.blocks.iter().flatten() {
                        memory.write(*address, data);
                    }
                }
                if request.arg2 >> 24 != 0 {
                    for &chip in &flood.targets {
                        self.start_cores(chip, request.arg2);
                    }
                }
                debug!("flood 완료: nn_id={}, 칩 {}개", nn_id, flood.targets.len());
                (ScpResult::Ok, Vec::new())
            }
            _ => (ScpResult::Cmd, Vec::new()),
        }
    }

    fn flood_data(&mut self, request: &ScpRequest) -> Reply {
        let nn_id = (request.arg1 & 0xFF) as u8;
        let block_no = ((request.arg2 >> 16) & 0xFF) as usize;
        let n_bytes = ((((request.arg2 >> 8) & 0xFF) + 1) * 4) as usize;
        let data = request.data.slice(..n_bytes.min(request.data.len()));
        let Some(flood) = self.floods.get_mut(&nn_id) else {
            return (ScpResult::Arg, Vec::new());
        };
        if flood.insert(block_no, request.arg3, data) {
            (ScpResult::Ok, Vec::new())
        } else {
            (ScpResult::Arg, Vec::new())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 보드 핸들
// ═══════════════════════════════════════════════════════════════════════════════

/// 실행 중인 가상 보드 핸들
pub struct VirtualBoard {
    local_addr: SocketAddr,
    state: Arc<Mutex<BoardState>>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl VirtualBoard {
    /// 바인드하고 수신 태스크 시작
    pub async fn start(bind_addr: SocketAddr, config: BoardConfig) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let state = Arc::new(Mutex::new(BoardState::new(config)));
        let running = Arc::new(AtomicBool::new(true));

        info!("가상 보드 시작: {}", local_addr);

        let state_task = state.clone();
        let running_task = running.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];

            while running_task.load(Ordering::SeqCst) {
                let (len, addr) = match tokio::time::timeout(
                    Duration::from_millis(10),
                    socket.recv_from(&mut buf),
                )
                .await
                {
                    Ok(Ok(received)) => received,
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                        continue;
                    }
                    Err(_) => continue,
                };

                let request = match ScpRequest::decode(&buf[..len]) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("잘못된 요청 ({} 바이트) from {}: {}", len, addr, e);
                        continue;
                    }
                };

                // 락은 송신 전에 놓는다
                let reply = state_task.lock().handle(&request);
                if let Some((result, data)) = reply {
                    let response = ScpResponse::encode(
                        &request.sdp_header.reply(),
                        result,
                        request.sequence.unwrap_or(0),
                        &data,
                    );
                    if let Err(e) = socket.send_to(&response, addr).await {
                        warn!("응답 송신 실패: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            state,
            running,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn topology(&self) -> MachineTopology {
        self.state.lock().config.topology
    }

    /// 다음 n 개 요청을 응답 없이 버림
    pub fn drop_next(&self, n: usize) {
        self.state.lock().drop_next = n;
    }

    /// 다음 n 개 요청에 RC_TIMEOUT 으로 응답
    pub fn reply_retry_code_next(&self, n: usize) {
        self.state.lock().retry_code_next = n;
    }

    /// 칩 메모리 직접 읽기
    pub fn memory(&self, chip: ChipCoord, address: u32, length: usize) -> Vec<u8> {
        match self.state.lock().memory.get(&chip) {
            Some(memory) => memory.read(address, length),
            None => vec![0; length],
        }
    }

    /// 보드 전체에서 `app_id` 이고 `state` 인 코어 수
    pub fn cores_in_state(&self, app_id: u8, state: CpuState) -> usize {
        self.state
            .lock()
            .cores
            .values()
            .filter(|(id, s)| *id == app_id && *s == state)
            .count()
    }

    pub fn stats(&self) -> BoardStats {
        self.state.lock().stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 정지
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("가상 보드 정지: {}", self.local_addr);
    }
}

impl Drop for VirtualBoard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
