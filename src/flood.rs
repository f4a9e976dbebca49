//! Flood-fill 대량 적재
//!
//! 같은 데이터를 모든 칩의 같은 주소에 한 번에 쓴다.
//!
//! ```text
//! START(nn_id, n_blocks) -> DATA(block 0..n) -> END(nn_id)
//! ```
//!
//! 각 단계는 별도 프로세스로 보내고, 단계가 끝날 때마다 에러를 확인한다.
//! 데이터 단계가 실패하면 END 는 보내지 않는다.

use std::io::Read;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::command::{check_address_range, flood_fill_data, flood_fill_end, flood_fill_start};
use crate::config::Config;
use crate::dispatch::Dispatchers;
use crate::error::{Error, Result};
use crate::lock::FloodGuard;
use crate::process::ScpProcess;
use crate::scp::SequenceGenerator;
use crate::selector::ConnectionSelector;
use crate::{MAX_WORDS_PER_DATAGRAM, UDP_MESSAGE_MAX_SIZE};

/// 가장 큰 nearest-neighbour id (0 은 예약)
const MAX_NN_ID: u8 = 126;

/// Start 요청의 블록 수 필드는 8비트
const MAX_BLOCKS: usize = u8::MAX as usize;

// ═══════════════════════════════════════════════════════════════════════════════
// Nearest-neighbour id
// ═══════════════════════════════════════════════════════════════════════════════

/// 세션 전체에서 공유하는 nearest-neighbour id 발급기
///
/// 1..=126 을 순환한다.
#[derive(Debug)]
pub struct NearestNeighbourIds {
    next: Mutex<u8>,
}

impl NearestNeighbourIds {
    pub fn new() -> Self {
        Self { next: Mutex::new(1) }
    }

    /// 다음 id
    pub fn next(&self) -> u8 {
        let mut next = self.next.lock();
        let id = *next;
        *next = if id >= MAX_NN_ID { 1 } else { id + 1 };
        id
    }
}

impl Default for NearestNeighbourIds {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 블록 분할
// ═══════════════════════════════════════════════════════════════════════════════

/// 데이터 블록 하나
#[derive(Debug, Clone)]
pub struct FloodBlock {
    /// 0부터 시작하는 블록 번호
    pub block_no: u8,
    /// 이 블록이 쓰일 절대 주소
    pub address: u32,
    pub data: Bytes,
}

/// n_bytes 를 보내는 데 필요한 블록 수
pub fn n_blocks(n_bytes: usize) -> usize {
    let n_words = (n_bytes + 3) / 4;
    (n_words + MAX_WORDS_PER_DATAGRAM - 1) / MAX_WORDS_PER_DATAGRAM
}

/// 블록 수 검증; 워드 패딩까지 주소 공간 안이어야 한다
fn check_size(base_address: u32, n_bytes: usize) -> Result<u8> {
    let blocks = n_blocks(n_bytes);
    if n_bytes == 0 || blocks > MAX_BLOCKS {
        return Err(Error::invalid_parameter(
            "n_bytes",
            n_bytes,
            format!("1..={} 바이트여야 함", MAX_BLOCKS * UDP_MESSAGE_MAX_SIZE),
        ));
    }
    check_address_range(base_address, (n_bytes + 3) & !3)?;
    Ok(blocks as u8)
}

/// 마지막 조각은 워드 단위로 0 패딩
fn pad_to_word(chunk: &[u8]) -> Bytes {
    let padded = (chunk.len() + 3) & !3;
    let mut buf = BytesMut::with_capacity(padded);
    buf.extend_from_slice(chunk);
    buf.resize(padded, 0);
    buf.freeze()
}

/// 데이터를 256 바이트 블록으로 분할
pub fn split_into_blocks(base_address: u32, data: &[u8]) -> Result<Vec<FloodBlock>> {
    check_size(base_address, data.len())?;
    let blocks = data
        .chunks(UDP_MESSAGE_MAX_SIZE)
        .enumerate()
        .map(|(i, chunk)| FloodBlock {
            block_no: i as u8,
            address: base_address + (i * UDP_MESSAGE_MAX_SIZE) as u32,
            data: pad_to_word(chunk),
        })
        .collect();
    Ok(blocks)
}

// ═══════════════════════════════════════════════════════════════════════════════
// 적재기
// ═══════════════════════════════════════════════════════════════════════════════

/// Flood-fill 트랜잭션 실행기
///
/// 호출자가 flood 락을 쥐고 있어야 하므로 모든 쓰기는 [`FloodGuard`] 를 받는다.
pub struct FloodFillLoader {
    selector: Arc<dyn ConnectionSelector>,
    config: Config,
    sequences: Arc<SequenceGenerator>,
    dispatchers: Arc<Dispatchers>,
    nn_ids: Arc<NearestNeighbourIds>,
}

impl FloodFillLoader {
    pub fn new(
        selector: Arc<dyn ConnectionSelector>,
        config: Config,
        sequences: Arc<SequenceGenerator>,
        dispatchers: Arc<Dispatchers>,
        nn_ids: Arc<NearestNeighbourIds>,
    ) -> Self {
        Self {
            selector,
            config,
            sequences,
            dispatchers,
            nn_ids,
        }
    }

    fn process(&self) -> ScpProcess<'static> {
        ScpProcess::shared(
            self.selector.clone(),
            self.config.clone(),
            self.sequences.clone(),
            self.dispatchers.clone(),
        )
    }

    /// 메모리의 데이터를 모든 칩의 `base_address` 에 쓰기
    pub fn write(&self, _guard: &FloodGuard<'_>, base_address: u32, data: &[u8]) -> Result<()> {
        let blocks = split_into_blocks(base_address, data)?;
        let n_blocks = blocks.len() as u8;
        let nn_id = self.nn_ids.next();
        info!(
            "flood fill 시작: nn_id={}, 주소=0x{:08x}, {} 바이트, {} 블록",
            nn_id,
            base_address,
            data.len(),
            n_blocks
        );

        self.start(nn_id, n_blocks)?;

        let mut process = self.process();
        for block in blocks {
            debug!("flood 블록 {} -> 0x{:08x}", block.block_no, block.address);
            let request = flood_fill_data(nn_id, block.block_no, block.address, block.data)?;
            process.send(request, None, None)?;
        }
        self.check(process, nn_id)?;

        self.end(nn_id)
    }

    /// 리더에서 `n_bytes` 만큼 읽어 flood 로 쓰기
    ///
    /// 리더가 `n_bytes` 전에 끝나면 END 없이 I/O 에러를 돌려준다.
    pub fn write_from_reader<R: Read>(
        &self,
        _guard: &FloodGuard<'_>,
        base_address: u32,
        reader: &mut R,
        n_bytes: usize,
    ) -> Result<()> {
        let n_blocks = check_size(base_address, n_bytes)?;
        let nn_id = self.nn_ids.next();
        info!(
            "flood fill 시작 (reader): nn_id={}, 주소=0x{:08x}, {} 바이트, {} 블록",
            nn_id, base_address, n_bytes, n_blocks
        );

        self.start(nn_id, n_blocks)?;

        let mut process = self.process();
        let mut remaining = n_bytes;
        let mut address = base_address;
        let mut block_no = 0u8;
        let mut chunk = vec![0u8; UDP_MESSAGE_MAX_SIZE];
        while remaining > 0 {
            let size = remaining.min(UDP_MESSAGE_MAX_SIZE);
            if let Err(e) = reader.read_exact(&mut chunk[..size]) {
                // 이미 보낸 블록의 응답은 받아 둔다
                let _ = process.finish();
                warn!("flood fill 중단: nn_id={}, 리더 에러: {}", nn_id, e);
                return Err(e.into());
            }
            let request = flood_fill_data(nn_id, block_no, address, pad_to_word(&chunk[..size]))?;
            process.send(request, None, None)?;

            block_no = block_no.wrapping_add(1);
            remaining -= size;
            // 마지막 블록 뒤에서는 주소 공간 끝에 닿을 수 있다
            address = address.wrapping_add(size as u32);
        }
        self.check(process, nn_id)?;

        self.end(nn_id)
    }

    fn start(&self, nn_id: u8, n_blocks: u8) -> Result<()> {
        let mut process = self.process();
        process.send(flood_fill_start(nn_id, n_blocks, None), None, None)?;
        self.check(process, nn_id)
    }

    fn end(&self, nn_id: u8) -> Result<()> {
        let mut process = self.process();
        process.send(flood_fill_end(nn_id, 0, 0, false), None, None)?;
        self.check(process, nn_id)?;
        info!("flood fill 완료: nn_id={}", nn_id);
        Ok(())
    }

    fn check(&self, mut process: ScpProcess<'_>, nn_id: u8) -> Result<()> {
        process.finish_and_check().map_err(|e| {
            warn!("flood fill 중단: nn_id={}, {}", nn_id, e);
            e
        })
    }
}
