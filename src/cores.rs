//! 칩/코어 주소 모델

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::{Error, Result};

/// 칩 좌표 (x, y)
pub type ChipCoord = (u8, u8);

/// 칩 하나와 그 위의 프로세서 집합
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSubset {
    x: u8,
    y: u8,
    processors: BTreeSet<u8>,
}

impl CoreSubset {
    pub fn new(x: u8, y: u8) -> Self {
        Self {
            x,
            y,
            processors: BTreeSet::new(),
        }
    }

    pub fn with_processors(x: u8, y: u8, processors: impl IntoIterator<Item = u8>) -> Self {
        Self {
            x,
            y,
            processors: processors.into_iter().collect(),
        }
    }

    /// 프로세서 추가 (이미 있으면 무시)
    pub fn add_processor(&mut self, p: u8) {
        self.processors.insert(p);
    }

    pub fn x(&self) -> u8 {
        self.x
    }

    pub fn y(&self) -> u8 {
        self.y
    }

    pub fn chip(&self) -> ChipCoord {
        (self.x, self.y)
    }

    pub fn processors(&self) -> impl Iterator<Item = u8> + '_ {
        self.processors.iter().copied()
    }

    pub fn contains(&self, p: u8) -> bool {
        self.processors.contains(&p)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// 프로세서 비트마스크 (bit p = 프로세서 p)
    pub fn processor_mask(&self) -> u32 {
        self.processors
            .iter()
            .filter(|&&p| p < 32)
            .fold(0, |mask, &p| mask | (1 << p))
    }
}

impl fmt::Display for CoreSubset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:?}", self.x, self.y, self.processors)
    }
}

/// 칩별 CoreSubset 의 순서 있는 집합 (칩당 하나)
#[derive(Debug, Clone, Default)]
pub struct CoreSubsets {
    subsets: Vec<CoreSubset>,
    index: HashMap<ChipCoord, usize>,
}

impl CoreSubsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// 새 칩의 CoreSubset 추가; 이미 있는 칩이면 에러
    pub fn add_core_subset(&mut self, subset: CoreSubset) -> Result<()> {
        let chip = subset.chip();
        if self.index.contains_key(&chip) {
            return Err(Error::invalid_parameter(
                "core_subset",
                subset,
                "이미 같은 칩의 CoreSubset 이 있음",
            ));
        }
        self.index.insert(chip, self.subsets.len());
        self.subsets.push(subset);
        Ok(())
    }

    /// 프로세서 추가; 칩이 없으면 새로 만든다
    pub fn add_processor(&mut self, x: u8, y: u8, p: u8) {
        match self.index.get(&(x, y)) {
            Some(&i) => self.subsets[i].add_processor(p),
            None => {
                self.index.insert((x, y), self.subsets.len());
                self.subsets.push(CoreSubset::with_processors(x, y, [p]));
            }
        }
    }

    pub fn get(&self, x: u8, y: u8) -> Option<&CoreSubset> {
        self.index.get(&(x, y)).map(|&i| &self.subsets[i])
    }

    pub fn is_chip(&self, x: u8, y: u8) -> bool {
        self.index.contains_key(&(x, y))
    }

    pub fn is_core(&self, x: u8, y: u8, p: u8) -> bool {
        self.get(x, y).map(|s| s.contains(p)).unwrap_or(false)
    }

    /// 삽입 순서대로 순회
    pub fn iter(&self) -> impl Iterator<Item = &CoreSubset> {
        self.subsets.iter()
    }

    pub fn chips(&self) -> impl Iterator<Item = ChipCoord> + '_ {
        self.subsets.iter().map(CoreSubset::chip)
    }

    pub fn len(&self) -> usize {
        self.subsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsets.is_empty()
    }

    /// 전체 코어 수
    pub fn n_cores(&self) -> usize {
        self.subsets.iter().map(CoreSubset::len).sum()
    }
}

impl<'a> IntoIterator for &'a CoreSubsets {
    type Item = &'a CoreSubset;
    type IntoIter = std::slice::Iter<'a, CoreSubset>;

    fn into_iter(self) -> Self::IntoIter {
        self.subsets.iter()
    }
}

/// 코어의 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CpuState {
    Dead = 0,
    PoweredDown = 1,
    RunTimeException = 2,
    Watchdog = 3,
    Initialising = 4,
    Ready = 5,
    CMain = 6,
    Running = 7,
    Sync0 = 8,
    Sync1 = 9,
    Paused = 10,
    Finished = 11,
    CpuState12 = 12,
    CpuState13 = 13,
    CpuState14 = 14,
    Idle = 15,
}

impl CpuState {
    pub fn from_u8(value: u8) -> Option<Self> {
        use CpuState::*;
        let state = match value {
            0 => Dead,
            1 => PoweredDown,
            2 => RunTimeException,
            3 => Watchdog,
            4 => Initialising,
            5 => Ready,
            6 => CMain,
            7 => Running,
            8 => Sync0,
            9 => Sync1,
            10 => Paused,
            11 => Finished,
            12 => CpuState12,
            13 => CpuState13,
            14 => CpuState14,
            15 => Idle,
            _ => return None,
        };
        Some(state)
    }

    /// 명령줄 인자 등에서 쓰는 이름으로 찾기
    pub fn from_name(name: &str) -> Option<Self> {
        use CpuState::*;
        let state = match name.to_ascii_lowercase().as_str() {
            "dead" => Dead,
            "powered_down" => PoweredDown,
            "run_time_exception" | "rte" => RunTimeException,
            "watchdog" => Watchdog,
            "initialising" => Initialising,
            "ready" => Ready,
            "c_main" => CMain,
            "running" => Running,
            "sync0" => Sync0,
            "sync1" => Sync1,
            "paused" => Paused,
            "finished" => Finished,
            "idle" => Idle,
            _ => return None,
        };
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_processor_twice() {
        let mut subsets = CoreSubsets::new();
        subsets.add_processor(1, 2, 3);
        subsets.add_processor(1, 2, 3);

        let subset = subsets.get(1, 2).unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subsets.n_cores(), 1);
        assert!(subsets.is_core(1, 2, 3));
        assert!(!subsets.is_core(1, 2, 4));
    }

    #[test]
    fn test_insertion_order() {
        let mut subsets = CoreSubsets::new();
        subsets.add_processor(5, 5, 1);
        subsets.add_processor(0, 0, 1);
        subsets.add_processor(2, 7, 1);
        subsets.add_processor(5, 5, 2);

        let chips: Vec<_> = subsets.chips().collect();
        assert_eq!(chips, vec![(5, 5), (0, 0), (2, 7)]);
        assert_eq!(subsets.get(5, 5).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_chip_rejected() {
        let mut subsets = CoreSubsets::new();
        subsets
            .add_core_subset(CoreSubset::with_processors(0, 0, [1, 2]))
            .unwrap();
        let result = subsets.add_core_subset(CoreSubset::new(0, 0));
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
        assert_eq!(subsets.len(), 1);
    }

    #[test]
    fn test_processor_mask() {
        let subset = CoreSubset::with_processors(0, 0, [1, 2, 17]);
        assert_eq!(subset.processor_mask(), 0b110 | (1 << 17));
    }

    #[test]
    fn test_cpu_state_names() {
        assert_eq!(CpuState::from_name("RUNNING"), Some(CpuState::Running));
        assert_eq!(CpuState::from_u8(15), Some(CpuState::Idle));
        assert_eq!(CpuState::from_u8(16), None);
    }
}
