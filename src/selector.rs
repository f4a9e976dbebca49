//! 연결 선택 전략
//!
//! - Fixed: 항상 같은 연결
//! - RoundRobin: 삽입 순서대로 돌아가며 선택
//! - MostDirect: 목적지 칩에 가장 가까운 이더넷 칩의 연결

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::connection::ScpConnection;
use crate::cores::ChipCoord;
use crate::error::{Error, Result};
use crate::scp::ScpRequest;

/// 요청을 보낼 연결 선택
pub trait ConnectionSelector: Send + Sync {
    fn select(&self, request: &ScpRequest) -> Arc<dyn ScpConnection>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// 머신 토폴로지 (트라이어드 기하)
// ═══════════════════════════════════════════════════════════════════════════════

/// 보드 하나의 48칩 외곽선: 행 y 별 x 범위 (포함)
const BOARD_ROWS: [(i32, i32); 8] = [
    (0, 4),
    (0, 5),
    (0, 6),
    (0, 7),
    (1, 7),
    (2, 7),
    (3, 7),
    (4, 7),
];

/// 12x12 타일 안 이더넷 칩 위치
const TRIAD_OFFSETS: [(i32, i32); 3] = [(0, 0), (4, 8), (8, 4)];

/// 트라이어드 타일 한 변
const TRIAD_SIZE: i32 = 12;

/// 머신 크기 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineTopology {
    pub width: u8,
    pub height: u8,
}

impl MachineTopology {
    pub fn new(width: u8, height: u8) -> Self {
        Self { width, height }
    }

    /// 보드 하나짜리 머신인지
    pub fn is_single_board(&self) -> bool {
        self.width <= 8 && self.height <= 8
    }

    /// 가장자리가 감기는 (토러스) 머신인지
    pub fn wraps(&self) -> bool {
        self.width as i32 % TRIAD_SIZE == 0 && self.height as i32 % TRIAD_SIZE == 0
    }

    /// 칩이 속한 보드의 이더넷 칩 좌표
    pub fn nearest_ethernet(&self, x: u8, y: u8) -> Option<ChipCoord> {
        if x >= self.width || y >= self.height {
            return None;
        }
        if self.is_single_board() {
            return Some((0, 0));
        }

        let (x, y) = (x as i32, y as i32);
        let (width, height) = (self.width as i32, self.height as i32);
        for (ox, oy) in TRIAD_OFFSETS {
            let lx = (x - ox).rem_euclid(TRIAD_SIZE);
            let ly = (y - oy).rem_euclid(TRIAD_SIZE);
            if !on_board(lx, ly) {
                continue;
            }
            let (ex, ey) = (x - lx, y - ly);
            if self.wraps() {
                return Some((ex.rem_euclid(width) as u8, ey.rem_euclid(height) as u8));
            }
            if ex < 0 || ey < 0 || ex >= width || ey >= height {
                return None;
            }
            return Some((ex as u8, ey as u8));
        }
        None
    }

    /// 이더넷 칩 좌표 전체
    pub fn ethernet_chips(&self) -> Vec<ChipCoord> {
        if self.is_single_board() {
            return vec![(0, 0)];
        }
        let mut chips = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                if self.nearest_ethernet(x, y) == Some((x, y)) {
                    chips.push((x, y));
                }
            }
        }
        chips
    }
}

fn on_board(lx: i32, ly: i32) -> bool {
    if !(0..8).contains(&ly) {
        return false;
    }
    let (min_x, max_x) = BOARD_ROWS[ly as usize];
    (min_x..=max_x).contains(&lx)
}

// ═══════════════════════════════════════════════════════════════════════════════
// 선택자
// ═══════════════════════════════════════════════════════════════════════════════

/// 항상 같은 연결
pub struct FixedConnectionSelector {
    connection: Arc<dyn ScpConnection>,
}

impl FixedConnectionSelector {
    pub fn new(connection: Arc<dyn ScpConnection>) -> Self {
        Self { connection }
    }
}

impl ConnectionSelector for FixedConnectionSelector {
    fn select(&self, _request: &ScpRequest) -> Arc<dyn ScpConnection> {
        self.connection.clone()
    }
}

/// 돌아가며 선택
pub struct RoundRobinConnectionSelector {
    connections: Vec<Arc<dyn ScpConnection>>,
    next: AtomicUsize,
}

impl RoundRobinConnectionSelector {
    pub fn new(connections: Vec<Arc<dyn ScpConnection>>) -> Result<Self> {
        if connections.is_empty() {
            return Err(Error::NoConnections);
        }
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }
}

impl ConnectionSelector for RoundRobinConnectionSelector {
    fn select(&self, _request: &ScpRequest) -> Arc<dyn ScpConnection> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }
}

/// 목적지에 가장 직접 닿는 연결 선택
pub struct MostDirectConnectionSelector {
    by_chip: HashMap<ChipCoord, Arc<dyn ScpConnection>>,
    default: Arc<dyn ScpConnection>,
    n_connections: usize,
    topology: RwLock<Option<MachineTopology>>,
}

impl MostDirectConnectionSelector {
    /// 기본 연결은 (0,0) 에 물린 연결, 없으면 첫 연결
    pub fn new(
        connections: Vec<Arc<dyn ScpConnection>>,
        topology: Option<MachineTopology>,
    ) -> Result<Self> {
        let first = connections.first().cloned().ok_or(Error::NoConnections)?;
        let mut by_chip = HashMap::new();
        for connection in &connections {
            by_chip
                .entry(connection.chip())
                .or_insert_with(|| connection.clone());
        }
        let default = by_chip.get(&(0, 0)).cloned().unwrap_or(first);

        Ok(Self {
            by_chip,
            default,
            n_connections: connections.len(),
            topology: RwLock::new(topology),
        })
    }

    /// 발견 이후 토폴로지 설정
    pub fn set_topology(&self, topology: MachineTopology) {
        *self.topology.write() = Some(topology);
    }

    pub fn topology(&self) -> Option<MachineTopology> {
        *self.topology.read()
    }

    /// 목적지 칩에 대한 선택 (요청 없이)
    pub fn select_for_chip(&self, x: u8, y: u8) -> Arc<dyn ScpConnection> {
        if self.n_connections == 1 {
            return self.default.clone();
        }
        if let Some(connection) = self.by_chip.get(&(x, y)) {
            return connection.clone();
        }
        let Some(topology) = *self.topology.read() else {
            return self.default.clone();
        };
        match topology.nearest_ethernet(x, y) {
            Some(ethernet) => match self.by_chip.get(&ethernet) {
                Some(connection) => connection.clone(),
                None => {
                    debug!("이더넷 칩 {:?} 에 물린 연결 없음, 기본 연결 사용", ethernet);
                    self.default.clone()
                }
            },
            None => self.default.clone(),
        }
    }
}

impl ConnectionSelector for MostDirectConnectionSelector {
    fn select(&self, request: &ScpRequest) -> Arc<dyn ScpConnection> {
        let header = &request.sdp_header;
        self.select_for_chip(header.destination_chip_x, header.destination_chip_y)
    }
}
