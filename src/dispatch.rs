//! 연결별 응답 분배기
//!
//! 여러 프로세스가 한 연결을 같이 쓸 때, 소켓에서 읽은 응답을 시퀀스 번호로
//! 주인 파이프라인의 수신함에 넣는다.
//!
//! 별도 스레드는 없다. 응답을 기다리는 쪽 중 하나가 수신 담당이 되어
//! 소켓을 읽고 나눠 주며, 나머지는 자기 수신함을 기다린다.
//! 담당은 `POLL_INTERVAL` 마다 놓아서 다른 대기자가 이어받을 수 있다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::ScpConnection;
use crate::error::{Error, Result};
use crate::scp::ScpResponse;

/// 수신 담당 교대 주기
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 연결 포인터로 만든 키
pub fn connection_key(connection: &Arc<dyn ScpConnection>) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}

/// 연결 하나의 응답 분배기
#[derive(Debug)]
pub struct ResponseDispatcher {
    connection: Arc<dyn ScpConnection>,
    /// 시퀀스 -> 주인 파이프라인 수신함
    routes: DashMap<u16, Sender<Bytes>>,
    /// 소켓을 읽는 담당
    receiving: Mutex<()>,
    n_stale: AtomicU64,
}

impl ResponseDispatcher {
    pub fn new(connection: Arc<dyn ScpConnection>) -> Self {
        Self {
            connection,
            routes: DashMap::new(),
            receiving: Mutex::new(()),
            n_stale: AtomicU64::new(0),
        }
    }

    pub fn connection(&self) -> &Arc<dyn ScpConnection> {
        &self.connection
    }

    /// 시퀀스의 응답을 받을 수신함 등록
    ///
    /// 이 연결에서 이미 쓰이는 시퀀스면 `InvalidParameter`.
    pub fn register(&self, sequence: u16, inbox: Sender<Bytes>) -> Result<()> {
        match self.routes.entry(sequence) {
            Entry::Occupied(_) => Err(Error::invalid_parameter(
                "sequence",
                sequence,
                "이 연결에서 응답을 기다리는 중",
            )),
            Entry::Vacant(entry) => {
                entry.insert(inbox);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, sequence: u16) {
        self.routes.remove(&sequence);
    }

    /// 시퀀스가 이 연결에서 쓰이는 중인지
    pub fn is_registered(&self, sequence: u16) -> bool {
        self.routes.contains_key(&sequence)
    }

    /// 주인이 없어 버린 응답 수
    pub fn n_stale(&self) -> u64 {
        self.n_stale.load(Ordering::Relaxed)
    }

    /// `inbox` 로 응답 하나가 올 때까지 대기
    ///
    /// 수신 담당이 비어 있으면 직접 소켓을 읽어 다른 수신함에도 나눠 준다.
    pub fn receive(&self, inbox: &Receiver<Bytes>, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(datagram) = inbox.try_recv() {
                return Ok(datagram);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    operation: "receive".into(),
                    timeout,
                });
            }
            let slice = remaining.min(POLL_INTERVAL);

            match self.receiving.try_lock() {
                Some(_turn) => match self.connection.receive_scp(slice) {
                    Ok(datagram) => self.route(datagram),
                    Err(e) if e.is_timeout() => {}
                    Err(e) => return Err(e),
                },
                None => match inbox.recv_timeout(slice) {
                    Ok(datagram) => return Ok(datagram),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
                },
            }
        }
    }

    fn route(&self, datagram: Bytes) {
        let sequence = match ScpResponse::peek(&datagram) {
            Ok((_, sequence)) => sequence,
            Err(e) => {
                warn!("잘못된 응답 무시: {}", e);
                return;
            }
        };
        match self.routes.get(&sequence) {
            Some(inbox) => {
                let _ = inbox.send(datagram);
            }
            None => {
                self.n_stale.fetch_add(1, Ordering::Relaxed);
                debug!("주인 없는 응답 무시: seq={}", sequence);
            }
        }
    }
}

/// 세션이 공유하는 연결별 분배기 모음
#[derive(Debug, Default)]
pub struct Dispatchers {
    by_connection: DashMap<usize, Arc<ResponseDispatcher>>,
}

impl Dispatchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 연결의 분배기 (없으면 생성)
    pub fn for_connection(&self, connection: &Arc<dyn ScpConnection>) -> Arc<ResponseDispatcher> {
        self.by_connection
            .entry(connection_key(connection))
            .or_insert_with(|| Arc::new(ResponseDispatcher::new(connection.clone())))
            .clone()
    }

    /// 모든 연결에서 주인 없이 버린 응답 수
    pub fn n_stale(&self) -> u64 {
        self.by_connection.iter().map(|d| d.n_stale()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crossbeam_channel::unbounded;

    use crate::scp::{ScpResult, SdpFlag, SdpHeader};
    use crate::testing::MockConnection;

    fn response(sequence: u16) -> Bytes {
        let header = SdpHeader::to_monitor(0, 0, SdpFlag::ReplyExpected).reply();
        ScpResponse::encode(&header, ScpResult::Ok, sequence, &[])
    }

    #[test]
    fn test_routes_by_sequence() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let dispatcher = ResponseDispatcher::new(mock.clone());
        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        dispatcher.register(1, tx_a).unwrap();
        dispatcher.register(2, tx_b).unwrap();

        // b 의 응답이 먼저 와도 a 는 자기 응답만 받는다
        mock.inject(response(2));
        mock.inject(response(1));
        let got = dispatcher.receive(&rx_a, Duration::from_millis(100)).unwrap();
        assert_eq!(ScpResponse::peek(&got).unwrap().1, 1);
        assert_eq!(ScpResponse::peek(&rx_b.try_recv().unwrap()).unwrap().1, 2);
        assert_eq!(dispatcher.n_stale(), 0);
    }

    #[test]
    fn test_unrouted_is_stale() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let dispatcher = ResponseDispatcher::new(mock.clone());
        let (tx, rx) = unbounded();
        dispatcher.register(5, tx).unwrap();
        mock.inject(response(9));

        let result = dispatcher.receive(&rx, Duration::from_millis(20));
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(dispatcher.n_stale(), 1);
    }

    #[test]
    fn test_sequence_taken() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let dispatcher = ResponseDispatcher::new(mock);
        let (tx, _rx) = unbounded();
        dispatcher.register(3, tx.clone()).unwrap();
        assert!(dispatcher.is_registered(3));
        assert!(matches!(
            dispatcher.register(3, tx.clone()),
            Err(Error::InvalidParameter { .. })
        ));
        dispatcher.unregister(3);
        dispatcher.register(3, tx).unwrap();
    }

    #[test]
    fn test_waiters_share_one_socket() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let dispatcher = ResponseDispatcher::new(mock.clone());
        let inboxes: Vec<_> = (0..4u16)
            .map(|sequence| {
                let (tx, rx) = unbounded();
                dispatcher.register(sequence, tx).unwrap();
                (sequence, rx)
            })
            .collect();
        for sequence in (0..4u16).rev() {
            mock.inject(response(sequence));
        }

        thread::scope(|s| {
            for (sequence, rx) in &inboxes {
                let dispatcher = &dispatcher;
                s.spawn(move || {
                    let got = dispatcher.receive(rx, Duration::from_secs(1)).unwrap();
                    assert_eq!(ScpResponse::peek(&got).unwrap().1, *sequence);
                });
            }
        });
        assert_eq!(dispatcher.n_stale(), 0);
    }

    #[test]
    fn test_one_dispatcher_per_connection() {
        let a: Arc<dyn ScpConnection> = Arc::new(MockConnection::new((0, 0)));
        let b: Arc<dyn ScpConnection> = Arc::new(MockConnection::new((4, 8)));
        let dispatchers = Dispatchers::new();
        assert!(Arc::ptr_eq(
            &dispatchers.for_connection(&a),
            &dispatchers.for_connection(&a)
        ));
        assert!(!Arc::ptr_eq(
            &dispatchers.for_connection(&a),
            &dispatchers.for_connection(&b)
        ));
    }
}
