//! 세션: 연결 풀과 세션 전역 상태를 묶는 컨텍스트
//!
//! 연결 풀, 선택자, 실행 락, nearest-neighbour id, 시퀀스 발급기, 응답 분배기를
//! 하나로 묶는다. 모든 고수준 연산은 여기서 시작한다.
//!
//! `Session` 은 여러 스레드에서 공유할 수 있다. 각 연산은 자기 프로세스를 만들고,
//! 같은 연결의 응답은 분배기가 시퀀스 번호로 주인에게 돌려준다.

use std::cell::{Cell, RefCell};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::command::{
    application_run, check_address_range, count_state, parse_count, read_memory, write_memory,
};
use crate::config::Config;
use crate::connection::{ConnectionPools, ScampConnection, ScpConnection};
use crate::cores::{ChipCoord, CoreSubset, CoreSubsets, CpuState};
use crate::dispatch::Dispatchers;
use crate::error::{Error, Result};
use crate::flood::{FloodFillLoader, NearestNeighbourIds};
use crate::lock::ExecutionLocks;
use crate::process::ScpProcess;
use crate::scp::{ScpRequest, ScpResponse, SequenceGenerator};
use crate::selector::{
    ConnectionSelector, FixedConnectionSelector, MachineTopology, MostDirectConnectionSelector,
};
use crate::{EXECUTABLE_ADDRESS, UDP_MESSAGE_MAX_SIZE};

/// 머신 하나와의 세션
pub struct Session {
    pools: ConnectionPools,
    selector: Arc<MostDirectConnectionSelector>,
    bmp_selector: Option<Arc<FixedConnectionSelector>>,
    config: Config,
    locks: ExecutionLocks,
    nn_ids: Arc<NearestNeighbourIds>,
    sequences: Arc<SequenceGenerator>,
    dispatchers: Arc<Dispatchers>,
    closed: AtomicBool,
}

impl Session {
    /// 분류된 연결 풀로 세션 생성
    ///
    /// SCP 연결이 하나도 없으면 `NoConnections`.
    pub fn new(pools: ConnectionPools, topology: Option<MachineTopology>, config: Config) -> Result<Self> {
        let selector = Arc::new(MostDirectConnectionSelector::new(
            pools.scp_connections.clone(),
            topology,
        )?);
        let bmp_selector = pools
            .bmp_connections
            .first()
            .map(|c| Arc::new(FixedConnectionSelector::new(c.clone())));

        info!(
            "세션 생성: SCP 연결 {}개, BMP 연결 {}개, 부트 연결 {}개, 토폴로지={:?}",
            pools.scp_connections.len(),
            pools.bmp_connections.len(),
            pools.boot_connections.len(),
            topology
        );

        Ok(Self {
            pools,
            selector,
            bmp_selector,
            config,
            locks: ExecutionLocks::new(),
            nn_ids: Arc::new(NearestNeighbourIds::new()),
            sequences: Arc::new(SequenceGenerator::new()),
            dispatchers: Arc::new(Dispatchers::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// 칩 (0,0) 의 이더넷 주소 하나로 세션 생성
    pub fn connect(remote: SocketAddr, topology: Option<MachineTopology>, config: Config) -> Result<Self> {
        let connection = ScampConnection::open(0, 0, None, remote)?
            .with_receive_buffer_size(config.receive_buffer_size);
        let connection: Arc<dyn ScpConnection> = Arc::new(connection);
        Self::new(ConnectionPools::from_scp(vec![connection]), topology, config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionPools {
        &self.pools
    }

    pub fn topology(&self) -> Option<MachineTopology> {
        self.selector.topology()
    }

    /// 발견 이후 토폴로지 반영
    pub fn set_topology(&self, topology: MachineTopology) {
        info!("토폴로지 설정: {}x{}", topology.width, topology.height);
        self.selector.set_topology(topology);
    }

    pub fn execution_locks(&self) -> &ExecutionLocks {
        &self.locks
    }

    /// 기다리는 요청이 없어 버린 응답 수 (모든 연결 합계)
    pub fn stale_responses(&self) -> u64 {
        self.dispatchers.n_stale()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// 기본 선택자를 쓰는 새 프로세스
    pub fn process<'a>(&self, config: Config) -> ScpProcess<'a> {
        ScpProcess::shared(
            self.scp_selector(),
            config,
            self.sequences.clone(),
            self.dispatchers.clone(),
        )
    }

    fn scp_selector(&self) -> Arc<dyn ConnectionSelector> {
        self.selector.clone()
    }

    fn loader(&self) -> FloodFillLoader {
        FloodFillLoader::new(
            self.scp_selector(),
            self.config.clone(),
            self.sequences.clone(),
            self.dispatchers.clone(),
            self.nn_ids.clone(),
        )
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // 단일 요청
    // ═══════════════════════════════════════════════════════════════════════════

    /// 요청 하나를 보내고 응답 대기
    pub fn send(&self, request: ScpRequest) -> Result<ScpResponse> {
        self.ensure_open()?;
        self.process(self.config.clone()).execute(request)
    }

    /// BMP 연결로 요청 하나 송신
    pub fn send_bmp(&self, request: ScpRequest) -> Result<ScpResponse> {
        self.ensure_open()?;
        let selector: Arc<dyn ConnectionSelector> =
            self.bmp_selector.clone().ok_or(Error::NoConnections)?;
        ScpProcess::shared(
            selector,
            Config::bmp(),
            self.sequences.clone(),
            self.dispatchers.clone(),
        )
        .execute(request)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // 메모리
    // ═══════════════════════════════════════════════════════════════════════════

    /// 칩 메모리 읽기 (256 바이트 단위로 나누어 파이프라인)
    pub fn read_memory(&self, x: u8, y: u8, base_address: u32, length: usize) -> Result<Bytes> {
        self.ensure_open()?;
        if length == 0 {
            return Ok(Bytes::new());
        }
        check_address_range(base_address, length)?;

        let buffer = RefCell::new(vec![0u8; length]);
        let mut process = self.process(self.config.clone());
        let mut offset = 0;
        while offset < length {
            let size = (length - offset).min(UDP_MESSAGE_MAX_SIZE);
            let request = read_memory(x, y, 0, base_address + offset as u32, size)?;
            let buffer = &buffer;
            process.send(
                request,
                Some(Box::new(move |response: &ScpResponse| {
                    let payload = response.payload();
                    if payload.len() < size {
                        return Err(Error::InvalidPacket {
                            packet_type: "read memory response".into(),
                            problem: format!("{} 바이트 요청, {} 바이트 수신", size, payload.len()),
                        });
                    }
                    buffer.borrow_mut()[offset..offset + size].copy_from_slice(&payload[..size]);
                    Ok(())
                })),
                None,
            )?;
            offset += size;
        }
        process.finish_and_check()?;
        drop(process);

        Ok(Bytes::from(buffer.into_inner()))
    }

    /// 칩 메모리 쓰기 (256 바이트 단위로 나누어 파이프라인)
    pub fn write_memory(&self, x: u8, y: u8, base_address: u32, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_address_range(base_address, data.len())?;
        let mut process = self.process(self.config.clone());
        for (i, chunk) in data.chunks(UDP_MESSAGE_MAX_SIZE).enumerate() {
            let address = base_address + (i * UDP_MESSAGE_MAX_SIZE) as u32;
            let request = write_memory(x, y, 0, address, Bytes::copy_from_slice(chunk))?;
            process.send(request, None, None)?;
        }
        process.finish_and_check()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Flood fill
    // ═══════════════════════════════════════════════════════════════════════════

    /// 모든 칩의 같은 주소에 데이터 쓰기
    pub fn flood_write(&self, base_address: u32, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let guard = self.locks.flood();
        self.loader().write(&guard, base_address, data)
    }

    /// 리더에서 `n_bytes` 만큼 읽어 모든 칩에 쓰기
    pub fn flood_write_from_reader<R: Read>(
        &self,
        base_address: u32,
        reader: &mut R,
        n_bytes: usize,
    ) -> Result<()> {
        self.ensure_open()?;
        let guard = self.locks.flood();
        self.loader()
            .write_from_reader(&guard, base_address, reader, n_bytes)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // 실행
    // ═══════════════════════════════════════════════════════════════════════════

    /// 칩 하나에 실행 파일을 적재하고 지정 프로세서에서 실행
    pub fn execute(
        &self,
        x: u8,
        y: u8,
        processors: impl IntoIterator<Item = u8>,
        executable: &[u8],
        app_id: u8,
        wait: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let subset = CoreSubset::with_processors(x, y, processors);
        // 적재 전에 검증
        let run = application_run(app_id, &subset, wait)?;

        let _guard = self.locks.chip_execute((x, y));
        debug!("칩 ({}, {}) 실행: {} 바이트, app_id={}", x, y, executable.len(), app_id);
        self.write_memory(x, y, EXECUTABLE_ADDRESS, executable)?;
        self.send(run)?;
        info!("칩 ({}, {}) 프로세서 {} 실행", x, y, subset);
        Ok(())
    }

    /// 실행 파일을 flood 로 모든 칩에 적재하고 대상 코어들에서 실행
    pub fn execute_flood(
        &self,
        core_subsets: &CoreSubsets,
        executable: &[u8],
        app_id: u8,
        wait: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let runs = core_subsets
            .iter()
            .map(|subset| application_run(app_id, subset, wait))
            .collect::<Result<Vec<_>>>()?;

        let guard = self.locks.flood();
        self.loader().write(&guard, EXECUTABLE_ADDRESS, executable)?;

        let mut process = self.process(self.config.clone());
        for run in runs {
            process.send(run, None, None)?;
        }
        process.finish_and_check()?;
        info!(
            "flood 실행 완료: 칩 {}개, 코어 {}개, app_id={}",
            core_subsets.len(),
            core_subsets.n_cores(),
            app_id
        );
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // 상태
    // ═══════════════════════════════════════════════════════════════════════════

    /// 카운트 요청을 보낼 칩들 (이더넷 칩, 토폴로지가 없으면 (0,0))
    fn count_chips(&self) -> Vec<ChipCoord> {
        match self.topology() {
            Some(topology) if !topology.is_single_board() => topology.ethernet_chips(),
            _ => vec![(0, 0)],
        }
    }

    /// 애플리케이션의 코어 중 `state` 인 코어 수
    pub fn get_cores_in_state(&self, app_id: u8, state: CpuState) -> Result<u32> {
        self.ensure_open()?;
        let template = count_state(app_id, state)?;
        let total = Cell::new(0u32);

        let mut process = self.process(Config::count_state());
        for (x, y) in self.count_chips() {
            let mut request = template.clone();
            request.sdp_header.destination_chip_x = x;
            request.sdp_header.destination_chip_y = y;
            let total = &total;
            process.send(
                request,
                Some(Box::new(move |response: &ScpResponse| {
                    total.set(total.get() + parse_count(response)?);
                    Ok(())
                })),
                None,
            )?;
        }
        process.finish_and_check()?;
        drop(process);

        Ok(total.get())
    }

    /// 모든 연결 닫기; 이후 연산은 `Closed`
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("세션 종료");
            self.pools.close_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::connection::Connection;

    use crate::scp::{ScpCommand, ScpResult};
    use crate::testing::{MockConnection, Reply};

    fn session_with(mock: &Arc<MockConnection>) -> Session {
        let connection: Arc<dyn ScpConnection> = mock.clone();
        Session::new(
            ConnectionPools::from_scp(vec![connection]),
            None,
            Config::default().with_timeout(Duration::from_millis(5)),
        )
        .unwrap()
    }

    #[test]
    fn test_no_connections() {
        let result = Session::new(ConnectionPools::default(), None, Config::default());
        assert!(matches!(result, Err(Error::NoConnections)));
    }

    #[test]
    fn test_read_memory_reassembles_chunks() {
        let mock = Arc::new(MockConnection::scripted(
            (0, 0),
            vec![
                Reply::Data(ScpResult::Ok, vec![1; 256]),
                Reply::Data(ScpResult::Ok, vec![2; 44]),
            ],
        ));
        let session = session_with(&mock);

        let data = session.read_memory(0, 0, 0x7000_0000, 300).unwrap();
        assert_eq!(data.len(), 300);
        assert!(data[..256].iter().all(|b| *b == 1));
        assert!(data[256..].iter().all(|b| *b == 2));

        let sent = mock.sent();
        assert_eq!(sent[1].arg1, 0x7000_0100);
        assert_eq!(sent[1].arg2, 44);
    }

    #[test]
    fn test_short_read_is_error() {
        let mock = Arc::new(MockConnection::scripted(
            (0, 0),
            vec![Reply::Data(ScpResult::Ok, vec![1; 10])],
        ));
        let session = session_with(&mock);
        assert!(matches!(
            session.read_memory(0, 0, 0, 16),
            Err(Error::InvalidPacket { .. })
        ));
    }

    #[test]
    fn test_execute_writes_then_runs() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let session = session_with(&mock);

        session.execute(1, 2, [1, 2], &[0u8; 300], 30, false).unwrap();

        let commands: Vec<_> = mock.sent().iter().map(|r| r.command).collect();
        assert_eq!(
            commands,
            vec![ScpCommand::Write, ScpCommand::Write, ScpCommand::Ar]
        );
        assert_eq!(mock.sent()[0].arg1, EXECUTABLE_ADDRESS);
        assert_eq!(session.execution_locks().active_chip_executes(), 0);
    }

    #[test]
    fn test_execute_rejects_bad_app_id_before_io() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let session = session_with(&mock);
        assert!(session.execute(0, 0, [1], &[0u8; 4], 0, false).is_err());
        assert_eq!(mock.sent_count(), 0);
    }

    #[test]
    fn test_execute_flood_runs_each_chip() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let session = session_with(&mock);
        let mut targets = CoreSubsets::new();
        targets.add_processor(0, 0, 1);
        targets.add_processor(1, 0, 1);
        targets.add_processor(1, 0, 2);

        session.execute_flood(&targets, &[9u8; 512], 16, true).unwrap();

        let sent = mock.sent();
        // START, DATA x2, END, AR x2
        assert_eq!(sent.len(), 6);
        assert_eq!(sent[4].command, ScpCommand::Ar);
        assert_eq!(sent[5].arg1 & 0x3FFFF, 0b110);
    }

    #[test]
    fn test_count_state_single_board() {
        let mock = Arc::new(MockConnection::scripted(
            (0, 0),
            vec![Reply::Data(ScpResult::Ok, 17u32.to_le_bytes().to_vec())],
        ));
        let session = session_with(&mock);
        assert_eq!(session.get_cores_in_state(16, CpuState::Running).unwrap(), 17);
    }

    #[test]
    fn test_count_state_sums_ethernet_chips() {
        let mock = Arc::new(MockConnection::scripted(
            (0, 0),
            vec![
                Reply::Data(ScpResult::Ok, 5u32.to_le_bytes().to_vec()),
                Reply::Data(ScpResult::Ok, 7u32.to_le_bytes().to_vec()),
                Reply::Data(ScpResult::Ok, 11u32.to_le_bytes().to_vec()),
            ],
        ));
        let session = session_with(&mock);
        session.set_topology(MachineTopology::new(12, 12));

        assert_eq!(session.get_cores_in_state(16, CpuState::Ready).unwrap(), 23);
        let destinations: Vec<_> = mock
            .sent()
            .iter()
            .map(|r| (r.sdp_header.destination_chip_x, r.sdp_header.destination_chip_y))
            .collect();
        assert_eq!(destinations, vec![(0, 0), (8, 4), (4, 8)]);
    }

    #[test]
    fn test_closed_session() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let session = session_with(&mock);
        session.close();
        assert!(session.is_closed());
        assert!(mock.is_closed());
        assert!(matches!(session.flood_write(0, &[1, 2, 3, 4]), Err(Error::Closed)));
    }

    #[test]
    fn test_memory_range_past_address_space() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let session = session_with(&mock);
        assert!(matches!(
            session.read_memory(0, 0, 0xFFFF_FF00, 300),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            session.write_memory(0, 0, 0xFFFF_FFF0, &[0u8; 17]),
            Err(Error::InvalidParameter { .. })
        ));
        assert_eq!(mock.sent_count(), 0);

        session.write_memory(0, 0, 0xFFFF_FE00, &[0u8; 512]).unwrap();
        assert_eq!(mock.sent()[1].arg1, 0xFFFF_FF00);
    }

    #[test]
    fn test_send_bmp_without_bmp() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let session = session_with(&mock);
        let request = crate::command::get_version(0, 0, 0);
        assert!(matches!(session.send_bmp(request), Err(Error::NoConnections)));
    }
}
