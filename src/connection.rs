//! UDP 연결과 연결 능력 트레이트
//!
//! - `UdpConnection`: 네트워크에 직접 닿는 유일한 타입
//! - `ScampConnection` / `BmpConnection`: SCP 송수신 가능
//! - `BootConnection`: 부트 메시지 송신만 가능

use std::fmt;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cores::ChipCoord;
use crate::error::{Error, Result};
use crate::UDP_BOOT_CONNECTION_DEFAULT_PORT;

/// 기본 수신 버퍼 크기 (최대 UDP 데이터그램)
const DEFAULT_RECEIVE_BUFFER: usize = 64 * 1024;

/// 부트 메시지 연속 송신 간격
const BOOT_ANTI_FLOOD_DELAY: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════════════════════
// 능력 트레이트
// ═══════════════════════════════════════════════════════════════════════════════

/// 모든 연결의 공통 능력
pub trait Connection: Send + Sync + fmt::Debug {
    /// 닫혔는지
    fn is_closed(&self) -> bool;

    /// 연결 닫기 (여러 번 호출 가능)
    fn close(&self);
}

/// SCP 요청 송신 능력
pub trait ScpSender: Connection {
    /// 이 연결이 물려 있는 칩 (기본 SDP 목적지)
    fn chip(&self) -> ChipCoord;

    /// 인코딩된 SCP 요청 데이터그램 송신
    fn send_scp(&self, datagram: &[u8]) -> Result<()>;
}

/// SCP 응답 수신 능력
pub trait ScpReceiver: Connection {
    /// 응답 데이터그램 하나 수신
    fn receive_scp(&self, timeout: Duration) -> Result<Bytes>;
}

/// SCP 송수신이 모두 되는 연결
pub trait ScpConnection: ScpSender + ScpReceiver {}

impl<T: ScpSender + ScpReceiver + ?Sized> ScpConnection for T {}

/// 부트 메시지 송신 능력
pub trait BootSender: Connection {
    fn send_boot_message(&self, message: &BootMessage) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// UDP 연결
// ═══════════════════════════════════════════════════════════════════════════════

/// UDP 소켓 하나를 소유하는 연결
///
/// 원격 주소가 있으면 `receive` 는 그 주소에서 온 데이터그램만 돌려준다.
pub struct UdpConnection {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    receive_buffer_size: usize,
}

impl UdpConnection {
    /// 소켓 바인드
    ///
    /// `local` 이 없으면 임의 포트, `remote` 가 없으면 수신 전용.
    pub fn open(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Result<Self> {
        let bind_addr = local
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        let socket = UdpSocket::bind(bind_addr)?;
        let local_addr = socket.local_addr()?;

        info!("UDP 연결 열림: local={}, remote={:?}", local_addr, remote);

        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            local_addr,
            remote_addr: remote,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER,
        })
    }

    /// 수신 버퍼 크기 변경
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size.max(1);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// 고정 원격 주소로 송신
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let remote = self.remote_addr.ok_or(Error::NotSendable)?;
        self.send_to(data, remote)
    }

    /// 락 밖에서 쓸 소켓 핸들; 닫혔으면 `Closed`
    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket.read().clone().ok_or(Error::Closed)
    }

    /// 지정 주소로 송신
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket()?.send_to(data, addr)?;
        Ok(())
    }

    /// 데이터그램 수신 (원격 주소가 있으면 다른 주소에서 온 것은 버림)
    pub fn receive(&self, timeout: Duration) -> Result<Bytes> {
        let Some(remote) = self.remote_addr else {
            return self.receive_with_address(timeout).map(|(data, _)| data);
        };
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    operation: "receive".into(),
                    timeout,
                });
            }
            let (data, from) = self.receive_with_address(remaining)?;
            if from == remote {
                return Ok(data);
            }
            debug!("원격 주소가 아닌 {} 에서 온 데이터그램 무시", from);
        }
    }

    /// 데이터그램과 송신 주소 수신
    pub fn receive_with_address(&self, timeout: Duration) -> Result<(Bytes, SocketAddr)> {
        let socket = self.socket()?;
        socket.set_read_timeout(Some(nonzero(timeout)))?;

        let mut buf = vec![0u8; self.receive_buffer_size];
        match socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                buf.truncate(len);
                Ok((Bytes::from(buf), addr))
            }
            Err(e) if is_timeout(&e) => Err(Error::Timeout {
                operation: "receive".into(),
                timeout,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// `timeout` 안에 읽을 데이터가 생기는지
    pub fn is_ready(&self, timeout: Duration) -> Result<bool> {
        let socket = self.socket()?;
        socket.set_read_timeout(Some(nonzero(timeout)))?;

        let mut probe = [0u8; 1];
        match socket.peek_from(&mut probe) {
            Ok(_) => Ok(true),
            Err(e) if is_timeout(&e) => Ok(false),
            // 버퍼보다 큰 데이터그램도 준비된 것으로 본다
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.socket.read().is_none()
    }

    /// 소켓 해제
    pub fn close(&self) {
        if self.socket.write().take().is_some() {
            info!("UDP 연결 닫힘: local={}", self.local_addr);
        }
    }
}

impl fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UdpConnection(local={}, remote={:?})",
            self.local_addr, self.remote_addr
        )
    }
}

fn nonzero(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCAMP 연결
// ═══════════════════════════════════════════════════════════════════════════════

/// 칩 하나의 SCAMP 에 물린 SCP 연결
pub struct ScampConnection {
    udp: UdpConnection,
    chip_x: u8,
    chip_y: u8,
}

impl ScampConnection {
    /// 칩 (x, y) 의 이더넷 주소로 연결
    pub fn open(chip_x: u8, chip_y: u8, local: Option<SocketAddr>, remote: SocketAddr) -> Result<Self> {
        Ok(Self {
            udp: UdpConnection::open(local, Some(remote))?,
            chip_x,
            chip_y,
        })
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.udp = self.udp.with_receive_buffer_size(size);
        self
    }

    pub fn udp(&self) -> &UdpConnection {
        &self.udp
    }
}

impl fmt::Debug for ScampConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ScampConnection(chip={},{}, remote={:?})",
            self.chip_x,
            self.chip_y,
            self.udp.remote_addr()
        )
    }
}

impl Connection for ScampConnection {
    fn is_closed(&self) -> bool {
        self.udp.is_closed()
    }

    fn close(&self) {
        self.udp.close();
    }
}

impl ScpSender for ScampConnection {
    fn chip(&self) -> ChipCoord {
        (self.chip_x, self.chip_y)
    }

    fn send_scp(&self, datagram: &[u8]) -> Result<()> {
        self.udp.send(datagram)
    }
}

impl ScpReceiver for ScampConnection {
    fn receive_scp(&self, timeout: Duration) -> Result<Bytes> {
        self.udp.receive(timeout)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BMP 연결
// ═══════════════════════════════════════════════════════════════════════════════

/// 보드 관리 프로세서 연결 (칩 (0,0) 처럼 주소 지정)
pub struct BmpConnection {
    udp: UdpConnection,
    cabinet: u8,
    frame: u8,
    boards: Vec<u8>,
}

impl BmpConnection {
    pub fn open(
        cabinet: u8,
        frame: u8,
        boards: Vec<u8>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<Self> {
        Ok(Self {
            udp: UdpConnection::open(local, Some(remote))?,
            cabinet,
            frame,
            boards,
        })
    }

    pub fn cabinet(&self) -> u8 {
        self.cabinet
    }

    pub fn frame(&self) -> u8 {
        self.frame
    }

    pub fn boards(&self) -> &[u8] {
        &self.boards
    }
}

impl fmt::Debug for BmpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BmpConnection(cabinet={}, frame={}, boards={:?}, remote={:?})",
            self.cabinet,
            self.frame,
            self.boards,
            self.udp.remote_addr()
        )
    }
}

impl Connection for BmpConnection {
    fn is_closed(&self) -> bool {
        self.udp.is_closed()
    }

    fn close(&self) {
        self.udp.close();
    }
}

impl ScpSender for BmpConnection {
    fn chip(&self) -> ChipCoord {
        (0, 0)
    }

    fn send_scp(&self, datagram: &[u8]) -> Result<()> {
        self.udp.send(datagram)
    }
}

impl ScpReceiver for BmpConnection {
    fn receive_scp(&self, timeout: Duration) -> Result<Bytes> {
        self.udp.receive(timeout)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 부트 연결
// ═══════════════════════════════════════════════════════════════════════════════

/// 부트 메시지 버전
const BOOT_MESSAGE_VERSION: u16 = 1;

/// 부트 메시지 최대 데이터 (256 워드)
const BOOT_MESSAGE_MAX_DATA: usize = 256 * 4;

/// 부트 연산 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BootOpCode {
    FloodFillStart = 0x1,
    FloodFillBlock = 0x3,
    FloodFillControl = 0x5,
    Hello = 0x41,
}

impl BootOpCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x1 => Some(BootOpCode::FloodFillStart),
            0x3 => Some(BootOpCode::FloodFillBlock),
            0x5 => Some(BootOpCode::FloodFillControl),
            0x41 => Some(BootOpCode::Hello),
            _ => None,
        }
    }
}

/// 부트 메시지 (빅 엔디언: version u16, opcode, operand 3개, 데이터)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMessage {
    pub opcode: BootOpCode,
    pub operands: [u32; 3],
    pub data: Bytes,
}

impl BootMessage {
    pub fn new(opcode: BootOpCode, operands: [u32; 3], data: Bytes) -> Result<Self> {
        if data.len() > BOOT_MESSAGE_MAX_DATA {
            return Err(Error::invalid_parameter(
                "data",
                data.len(),
                "부트 메시지는 최대 256 워드",
            ));
        }
        Ok(Self {
            opcode,
            operands,
            data,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(18 + self.data.len());
        buf.put_u16(BOOT_MESSAGE_VERSION);
        buf.put_u32(self.opcode as u32);
        for operand in self.operands {
            buf.put_u32(operand);
        }
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < 18 {
            return Err(Error::InvalidPacket {
                packet_type: "boot".into(),
                problem: format!("길이 {} < 18", bytes.len()),
            });
        }
        bytes.advance(2);
        let raw = bytes.get_u32();
        let opcode = BootOpCode::from_u32(raw).ok_or_else(|| Error::InvalidPacket {
            packet_type: "boot".into(),
            problem: format!("알 수 없는 연산 코드 0x{:x}", raw),
        })?;
        let operands = [bytes.get_u32(), bytes.get_u32(), bytes.get_u32()];
        Self::new(opcode, operands, bytes)
    }
}

/// 부트 전용 연결
pub struct BootConnection {
    udp: UdpConnection,
}

impl BootConnection {
    /// 보드 부트 포트로 연결
    pub fn open(local: Option<SocketAddr>, remote_host: Ipv4Addr) -> Result<Self> {
        let remote = SocketAddr::V4(SocketAddrV4::new(remote_host, UDP_BOOT_CONNECTION_DEFAULT_PORT));
        Ok(Self {
            udp: UdpConnection::open(local, Some(remote))?,
        })
    }

    /// 부트 메시지 수신
    pub fn receive_boot_message(&self, timeout: Duration) -> Result<BootMessage> {
        BootMessage::from_bytes(self.udp.receive(timeout)?)
    }
}

impl fmt::Debug for BootConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BootConnection(remote={:?})", self.udp.remote_addr())
    }
}

impl Connection for BootConnection {
    fn is_closed(&self) -> bool {
        self.udp.is_closed()
    }

    fn close(&self) {
        self.udp.close();
    }
}

impl BootSender for BootConnection {
    fn send_boot_message(&self, message: &BootMessage) -> Result<()> {
        self.udp.send(&message.to_bytes())?;
        thread::sleep(BOOT_ANTI_FLOOD_DELAY);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 분류
// ═══════════════════════════════════════════════════════════════════════════════

/// 연결 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Scp,
    Bmp,
    Boot,
}

/// 발견 단계에서 넘어오는 연결
#[derive(Debug, Clone)]
pub enum AnyConnection {
    Scamp(Arc<ScampConnection>),
    Bmp(Arc<BmpConnection>),
    Boot(Arc<BootConnection>),
}

impl AnyConnection {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            AnyConnection::Scamp(_) => ConnectionKind::Scp,
            AnyConnection::Bmp(_) => ConnectionKind::Bmp,
            AnyConnection::Boot(_) => ConnectionKind::Boot,
        }
    }
}

/// 종류별 연결 풀
#[derive(Debug, Clone, Default)]
pub struct ConnectionPools {
    pub scp_connections: Vec<Arc<dyn ScpConnection>>,
    pub bmp_connections: Vec<Arc<dyn ScpConnection>>,
    pub boot_connections: Vec<Arc<dyn BootSender>>,
}

impl ConnectionPools {
    /// 연결을 종류별 풀로 분류
    pub fn classify(connections: impl IntoIterator<Item = AnyConnection>) -> Self {
        let mut pools = Self::default();
        for connection in connections {
            debug!("연결 분류: {:?} -> {:?}", connection, connection.kind());
            match connection {
                AnyConnection::Scamp(c) => pools.scp_connections.push(c),
                AnyConnection::Bmp(c) => pools.bmp_connections.push(c),
                AnyConnection::Boot(c) => pools.boot_connections.push(c),
            }
        }
        pools
    }

    /// SCP 연결만으로 구성
    pub fn from_scp(scp_connections: Vec<Arc<dyn ScpConnection>>) -> Self {
        Self {
            scp_connections,
            ..Self::default()
        }
    }

    /// 모든 연결 닫기
    pub fn close_all(&self) {
        for c in &self.scp_connections {
            c.close();
        }
        for c in &self.bmp_connections {
            c.close();
        }
        for c in &self.boot_connections {
            c.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_send_without_remote() {
        let connection = UdpConnection::open(Some(loopback()), None).unwrap();
        assert!(matches!(connection.send(b"x"), Err(Error::NotSendable)));
    }

    #[test]
    fn test_send_and_receive() {
        let a = UdpConnection::open(Some(loopback()), None).unwrap();
        let b = UdpConnection::open(Some(loopback()), Some(a.local_addr())).unwrap();

        b.send(b"hello").unwrap();
        assert!(a.is_ready(Duration::from_secs(1)).unwrap());
        let (data, from) = a.receive_with_address(Duration::from_secs(1)).unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(from, b.local_addr());

        a.send_to(b"back", from).unwrap();
        assert_eq!(&b.receive(Duration::from_secs(1)).unwrap()[..], b"back");
    }

    #[test]
    fn test_receive_timeout() {
        let connection = UdpConnection::open(Some(loopback()), None).unwrap();
        let result = connection.receive(Duration::from_millis(20));
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(!connection.is_ready(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_close_idempotent() {
        let connection = UdpConnection::open(Some(loopback()), Some(loopback())).unwrap();
        connection.close();
        connection.close();
        assert!(connection.is_closed());
        assert!(matches!(connection.send(b"x"), Err(Error::Closed)));
        assert!(matches!(
            connection.receive(Duration::from_millis(1)),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_receive_filters_other_peers() {
        let a = UdpConnection::open(Some(loopback()), None).unwrap();
        let expected = UdpConnection::open(Some(loopback()), Some(a.local_addr())).unwrap();
        let receiver =
            UdpConnection::open(Some(loopback()), Some(expected.local_addr())).unwrap();

        a.send_to(b"intruder", receiver.local_addr()).unwrap();
        expected.send_to(b"reply", receiver.local_addr()).unwrap();
        assert_eq!(&receiver.receive(Duration::from_secs(1)).unwrap()[..], b"reply");

        a.send_to(b"intruder", receiver.local_addr()).unwrap();
        assert!(matches!(
            receiver.receive(Duration::from_millis(50)),
            Err(Error::Timeout { .. })
        ));
    }

    #[test]
    fn test_close_does_not_wait_for_receive() {
        let connection = Arc::new(UdpConnection::open(Some(loopback()), None).unwrap());
        let waiting = connection.clone();
        let receiver = thread::spawn(move || waiting.receive(Duration::from_millis(500)));

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        connection.close();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(connection.is_closed());
        assert!(receiver.join().unwrap().is_err());
    }

    #[test]
    fn test_boot_message_layout() {
        let message = BootMessage::new(BootOpCode::Hello, [1, 2, 3], Bytes::from_static(b"ab")).unwrap();
        let bytes = message.to_bytes();
        assert_eq!(&bytes[0..6], &[0, 1, 0, 0, 0, 0x41]);
        assert_eq!(bytes.len(), 20);
        assert_eq!(BootMessage::from_bytes(bytes).unwrap(), message);

        let too_big = Bytes::from(vec![0u8; BOOT_MESSAGE_MAX_DATA + 1]);
        assert!(BootMessage::new(BootOpCode::FloodFillBlock, [0; 3], too_big).is_err());
    }

    #[test]
    fn test_classify() {
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let scamp = Arc::new(ScampConnection::open(0, 0, Some(loopback()), remote).unwrap());
        let bmp = Arc::new(BmpConnection::open(0, 0, vec![0], Some(loopback()), remote).unwrap());
        let boot = Arc::new(BootConnection::open(Some(loopback()), Ipv4Addr::LOCALHOST).unwrap());

        let pools = ConnectionPools::classify(vec![
            AnyConnection::Boot(boot),
            AnyConnection::Scamp(scamp),
            AnyConnection::Bmp(bmp),
        ]);
        assert_eq!(pools.scp_connections.len(), 1);
        assert_eq!(pools.bmp_connections.len(), 1);
        assert_eq!(pools.boot_connections.len(), 1);

        pools.close_all();
        assert!(pools.scp_connections[0].is_closed());
    }
}
