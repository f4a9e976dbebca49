//! SCP 프로브 - 보드에 단일 질의를 보내는 도구
//!
//! 사용법:
//!   cargo run --release --bin scp-probe -- [OPTIONS] <COMMAND> [ARGS]
//!
//! 예시:
//!   # 칩 (0,0) 모니터 버전
//!   cargo run --release --bin scp-probe -- --target 192.168.240.253:17893 version 0 0 0
//!
//!   # app 16 의 running 코어 수 (48 칩 보드 3장)
//!   cargo run --release --bin scp-probe -- -t 10.0.0.1:17893 --machine 12x12 count 16 running
//!
//!   # 메모리 덤프
//!   cargo run --release --bin scp-probe -- read 0 0 0x67800000 64

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use scamp_link::command::{get_version, VersionInfo};
use scamp_link::{Config, CpuState, MachineTopology, Session, SCP_SCAMP_PORT};

/// 실행할 질의
enum Query {
    Version { x: u8, y: u8, p: u8 },
    Count { app_id: u8, state: CpuState },
    Read { x: u8, y: u8, address: u32, length: usize },
}

/// 프로브 설정
struct ProbeConfig {
    target: SocketAddr,
    topology: Option<MachineTopology>,
    verbose: bool,
    query: Option<Query>,
    config: Config,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::from((Ipv4Addr::LOCALHOST, SCP_SCAMP_PORT)),
            topology: None,
            verbose: false,
            query: None,
            config: Config::default(),
        }
    }
}

fn parse<T: FromStr>(args: &[String], i: usize, what: &str) -> Result<T, String> {
    let value = args.get(i).ok_or_else(|| format!("{} 값이 필요함", what))?;
    value
        .parse()
        .map_err(|_| format!("유효한 {} 필요: {}", what, value))
}

fn parse_address(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("유효한 주소 필요: {}", value))
}

fn parse_machine(value: &str) -> Result<MachineTopology, String> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| format!("WxH 형식 필요: {}", value))?;
    let width = width.parse().map_err(|_| format!("유효한 너비 필요: {}", value))?;
    let height = height.parse().map_err(|_| format!("유효한 높이 필요: {}", value))?;
    Ok(MachineTopology::new(width, height))
}

fn print_help() {
    println!(
        r#"SCP Probe - SCAMP 보드 질의 도구

사용법:
  cargo run --release --bin scp-probe -- [OPTIONS] <COMMAND> [ARGS]

명령:
  version <X> <Y> <P>              코어의 소프트웨어 버전
  count <APP_ID> <STATE>           app 의 STATE 코어 수 (running, ready, sync0, ...)
  read <X> <Y> <ADDR> <LEN>        칩 메모리 읽기 (ADDR 는 0x 접두 16진수 가능)

옵션:
  -t, --target <ADDR>     칩 (0,0) 이더넷 주소 (기본: 127.0.0.1:17893)
  -m, --machine <WxH>     머신 크기 (예: 12x12); 지정 시 이더넷 칩별로 카운트
  --timeout <MS>          요청 타임아웃 밀리초 (기본: 1000)
  --retries <N>           요청당 총 송신 횟수 (기본: 3)
  --patient               손실 링크용 설정
  -v, --verbose           디버그 로그
  -h, --help              이 도움말 출력

예시:
  # 가상 보드에 버전 질의
  cargo run --release --bin scp-probe -- -t 127.0.0.1:17893 version 0 0 0
"#
    );
}

fn parse_args() -> Result<ProbeConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ProbeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--target" | "-t" => {
                config.target = parse(&args, i + 1, "주소")?;
                i += 1;
            }
            "--machine" | "-m" => {
                let value: String = parse(&args, i + 1, "머신 크기")?;
                config.topology = Some(parse_machine(&value)?);
                i += 1;
            }
            "--timeout" => {
                let ms: u64 = parse(&args, i + 1, "숫자")?;
                config.config.scp_timeout = Duration::from_millis(ms);
                i += 1;
            }
            "--retries" => {
                config.config.n_retries = parse(&args, i + 1, "숫자")?;
                i += 1;
            }
            "--patient" => {
                config.config = Config::patient();
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "version" => {
                config.query = Some(Query::Version {
                    x: parse(&args, i + 1, "X")?,
                    y: parse(&args, i + 2, "Y")?,
                    p: parse(&args, i + 3, "P")?,
                });
                i += 3;
            }
            "count" => {
                let state: String = parse(&args, i + 2, "상태")?;
                config.query = Some(Query::Count {
                    app_id: parse(&args, i + 1, "APP_ID")?,
                    state: CpuState::from_name(&state)
                        .ok_or_else(|| format!("알 수 없는 상태: {}", state))?,
                });
                i += 2;
            }
            "read" => {
                let address: String = parse(&args, i + 3, "주소")?;
                config.query = Some(Query::Read {
                    x: parse(&args, i + 1, "X")?,
                    y: parse(&args, i + 2, "Y")?,
                    address: parse_address(&address)?,
                    length: parse(&args, i + 4, "길이")?,
                });
                i += 4;
            }
            other => {
                return Err(format!("알 수 없는 인자: {}", other));
            }
        }
        i += 1;
    }

    Ok(config)
}

fn hex_dump(base: u32, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:08x}  {}", base as usize + i * 16, bytes.join(" "));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let probe = match parse_args() {
        Ok(probe) => probe,
        Err(message) => {
            eprintln!("{}\n--help 로 사용법 확인", message);
            std::process::exit(2);
        }
    };

    // 로깅 설정 (RUST_LOG 가 있으면 우선)
    let level = if probe.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(query) = probe.query else {
        print_help();
        std::process::exit(2);
    };

    info!("대상: {}", probe.target);
    let session = Session::connect(probe.target, probe.topology, probe.config)?;
    let start = Instant::now();

    match query {
        Query::Version { x, y, p } => {
            let response = session.send(get_version(x, y, p))?;
            let version = VersionInfo::decode(response.payload())?;
            let (major, minor, patch) = version.version_number;
            println!(
                "({}, {}, {}) phys={} {}/{} {}.{}.{} build={}",
                version.x,
                version.y,
                version.p,
                version.physical_cpu_id,
                version.name,
                version.hardware,
                major,
                minor,
                patch,
                version.build_date
            );
        }
        Query::Count { app_id, state } => {
            let count = session.get_cores_in_state(app_id, state)?;
            println!("app {} {:?}: {}", app_id, state, count);
        }
        Query::Read {
            x,
            y,
            address,
            length,
        } => {
            let data = session.read_memory(x, y, address, length)?;
            hex_dump(address, &data);
        }
    }

    info!("완료: {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);
    session.close();
    Ok(())
}
