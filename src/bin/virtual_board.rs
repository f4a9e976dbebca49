//! 가상 보드 - SCP 요청에 응답하는 흉내 SCAMP
//!
//! 사용법:
//!   cargo run --release --bin virtual-board -- [OPTIONS]
//!
//! 예시:
//!   # 기본 8x8 보드
//!   cargo run --release --bin virtual-board -- --bind 127.0.0.1:17893
//!
//!   # 3 보드 머신, 요청 10% 손실
//!   cargo run --release --bin virtual-board -- --machine 12x12 --loss 0.1

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use scamp_link::emulator::{BoardConfig, VirtualBoard};
use scamp_link::{MachineTopology, SCP_SCAMP_PORT};

/// 보드 실행 설정
struct BoardSettings {
    bind_addr: SocketAddr,
    verbose: bool,
    stats_interval: Duration,
    board: BoardConfig,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, SCP_SCAMP_PORT)),
            verbose: false,
            stats_interval: Duration::from_secs(10),
            board: BoardConfig::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, what: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값이 필요함", what))
}

fn parse_args() -> Result<BoardSettings, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut settings = BoardSettings::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                let addr = value(&args, i + 1, "주소")?;
                settings.bind_addr = addr
                    .parse()
                    .map_err(|_| format!("유효한 주소 필요: {}", addr))?;
                i += 1;
            }
            "--machine" | "-m" => {
                let machine = value(&args, i + 1, "머신 크기")?;
                let (width, height) = machine
                    .split_once('x')
                    .and_then(|(w, h)| Some((w.parse().ok()?, h.parse().ok()?)))
                    .ok_or_else(|| format!("WxH 형식 필요: {}", machine))?;
                settings.board.topology = MachineTopology::new(width, height);
                i += 1;
            }
            "--loss" => {
                let loss = value(&args, i + 1, "손실 비율")?;
                let loss: f64 = loss
                    .parse()
                    .map_err(|_| format!("유효한 숫자 필요: {}", loss))?;
                settings.board.loss_probability = loss.clamp(0.0, 1.0);
                i += 1;
            }
            "--stats" => {
                let secs = value(&args, i + 1, "초")?;
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| format!("유효한 숫자 필요: {}", secs))?;
                settings.stats_interval = Duration::from_secs(secs.max(1));
                i += 1;
            }
            "--verbose" | "-v" => {
                settings.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"Virtual Board - 흉내 SCAMP 응답기

VER / READ / WRITE / AR / SIG(count) / NNP / FFD 에 응답
- flood fill 블록을 모아 END 에서 모든 대상 칩에 반영
- 요청 손실 흉내

사용법:
  cargo run --release --bin virtual-board -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 127.0.0.1:17893)
  -m, --machine <WxH>     머신 크기 (기본: 8x8)
  --loss <RATIO>          요청 손실 비율 0.0~1.0 (기본: 0)
  --stats <SECS>          통계 출력 주기 (기본: 10)
  -v, --verbose           디버그 로그
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => {
                return Err(format!("알 수 없는 인자: {}", other));
            }
        }
        i += 1;
    }

    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = match parse_args() {
        Ok(settings) => settings,
        Err(message) => {
            eprintln!("{}\n--help 로 사용법 확인", message);
            std::process::exit(2);
        }
    };

    // 로깅 설정
    let level = if settings.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Virtual board starting...");
    info!(
        "Machine: {}x{}",
        settings.board.topology.width, settings.board.topology.height
    );
    info!("Loss: {:.1}%", settings.board.loss_probability * 100.0);

    let mut board = VirtualBoard::start(settings.bind_addr, settings.board).await?;
    info!("Listening on {}", board.local_addr());

    let mut ticker = tokio::time::interval(settings.stats_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = board.stats();
                info!(
                    "received={} replied={} dropped={}",
                    stats.received, stats.replied, stats.dropped
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    board.stop().await;
    Ok(())
}
