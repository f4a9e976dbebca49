//! 단위 테스트용 가짜 연결

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::{Connection, ScpReceiver, ScpSender};
use crate::cores::ChipCoord;
use crate::error::{Error, Result};
use crate::scp::{ScpRequest, ScpResponse, ScpResult};

/// 송신 1회에 대한 가짜 보드의 반응
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// 응답 없음 (수신 시 타임아웃)
    Drop,
    /// 결과 코드만
    Result(ScpResult),
    /// 결과 코드와 데이터
    Data(ScpResult, Vec<u8>),
}

/// 송신마다 스크립트대로 응답하는 연결
///
/// 스크립트가 비면 `RC_OK` 로 응답한다. 대기 응답이 없으면 수신은 `timeout` 만큼 잠든 뒤 타임아웃.
#[derive(Debug)]
pub(crate) struct MockConnection {
    chip: ChipCoord,
    script: Mutex<VecDeque<Reply>>,
    pending: Mutex<VecDeque<Bytes>>,
    sent: Mutex<Vec<ScpRequest>>,
    closed: AtomicBool,
}

impl MockConnection {
    pub(crate) fn new(chip: ChipCoord) -> Self {
        Self {
            chip,
            script: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn scripted(chip: ChipCoord, replies: impl IntoIterator<Item = Reply>) -> Self {
        let connection = Self::new(chip);
        connection.script.lock().extend(replies);
        connection
    }

    /// 지금까지 송신된 요청
    pub(crate) fn sent(&self) -> Vec<ScpRequest> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// 스크립트와 무관한 응답을 수신 대기열에 직접 넣기
    pub(crate) fn inject(&self, datagram: Bytes) {
        self.pending.lock().push_back(datagram);
    }
}

impl Connection for MockConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl ScpSender for MockConnection {
    fn chip(&self) -> ChipCoord {
        self.chip
    }

    fn send_scp(&self, datagram: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let request = ScpRequest::decode(datagram)?;
        let sequence = request.sequence.unwrap_or(0);
        let reply_header = request.sdp_header.reply();
        self.sent.lock().push(request);

        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(Reply::Result(ScpResult::Ok));
        let response = match reply {
            Reply::Drop => return Ok(()),
            Reply::Result(result) => ScpResponse::encode(&reply_header, result, sequence, &[]),
            Reply::Data(result, data) => {
                ScpResponse::encode(&reply_header, result, sequence, &data)
            }
        };
        self.pending.lock().push_back(response);
        Ok(())
    }
}

impl ScpReceiver for MockConnection {
    fn receive_scp(&self, timeout: Duration) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(datagram) = self.pending.lock().pop_front() {
            return Ok(datagram);
        }
        thread::sleep(timeout);
        Err(Error::Timeout {
            operation: "mock receive".into(),
            timeout,
        })
    }
}
