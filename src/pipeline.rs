//! 연결 하나 위의 SCP 요청 윈도우
//!
//! - 채널 수 만큼만 동시에 응답을 기다린다
//! - 채널이 가득 차면 `intermediate_channel_waits` 이하가 될 때까지 수신
//! - 수신 타임아웃이면 미해결 요청 전부를 같은 데이터그램으로 재전송
//! - 재시도 결과 코드는 잠시 후 재전송, 같은 예산을 소모
//!
//! 수신은 호출 스레드에서 `send`/`finish` 안에서 일어난다. 응답은 연결의
//! [`ResponseDispatcher`] 를 거쳐 이 파이프라인의 수신함으로 온다.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::ScpConnection;
use crate::dispatch::ResponseDispatcher;
use crate::error::{Error, Result};
use crate::scp::{ScpRequest, ScpResponse, ScpResult};
use crate::stats::PipelineStats;

/// 성공 콜백: 응답 해석이 실패하면 그 요청의 에러로 기록된다
pub type SuccessCallback<'a> = Box<dyn FnOnce(&ScpResponse) -> Result<()> + 'a>;

/// 에러 콜백
pub type ErrorCallback<'a> = Box<dyn FnOnce(&ScpRequest, &Error) + 'a>;

/// 타임아웃 재전송 사유
const TIMEOUT_REASON: &str = "timeout";

/// 응답을 기다리는 요청
struct Outstanding<'a> {
    request: ScpRequest,
    datagram: Bytes,
    sends_remaining: u32,
    retry_reasons: Vec<String>,
    sent_at: Instant,
    on_success: Option<SuccessCallback<'a>>,
    on_error: Option<ErrorCallback<'a>>,
}

/// 실패한 요청 기록
#[derive(Debug, Clone)]
pub struct Failure {
    pub request: ScpRequest,
    pub error: Error,
}

/// 재전송 종류
#[derive(Clone, Copy)]
enum Resend {
    Timeout,
    RetryCode,
}

/// 연결 하나의 요청 파이프라인
pub struct ScpPipeline<'a> {
    dispatcher: Arc<ResponseDispatcher>,
    inbox_tx: Sender<Bytes>,
    inbox: Receiver<Bytes>,
    config: Config,
    outstanding: HashMap<u16, Outstanding<'a>>,
    failures: Vec<Failure>,
    stats: PipelineStats,
}

impl<'a> ScpPipeline<'a> {
    pub fn new(dispatcher: Arc<ResponseDispatcher>, config: Config) -> Self {
        let stats = PipelineStats::new(format!("{:?}", dispatcher.connection()));
        let (inbox_tx, inbox) = unbounded();
        Self {
            dispatcher,
            inbox_tx,
            inbox,
            config,
            outstanding: HashMap::new(),
            failures: Vec::new(),
            stats,
        }
    }

    pub fn connection(&self) -> &Arc<dyn ScpConnection> {
        self.dispatcher.connection()
    }

    /// 다른 프로세스를 포함해 이 연결에서 시퀀스가 쓰이는 중인지
    pub fn is_sequence_taken(&self, sequence: u16) -> bool {
        self.dispatcher.is_registered(sequence)
    }

    /// 응답을 기다리는 요청 수
    pub fn in_progress(&self) -> usize {
        self.outstanding.len()
    }

    /// 시퀀스가 아직 미해결인지
    pub fn is_outstanding(&self, sequence: u16) -> bool {
        self.outstanding.contains_key(&sequence)
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// 쌓인 실패 기록 꺼내기
    pub fn take_failures(&mut self) -> Vec<Failure> {
        std::mem::take(&mut self.failures)
    }

    /// 요청 송신
    ///
    /// 채널이 가득 차 있으면 먼저 응답을 받아 자리를 만든다.
    /// 인코딩이나 첫 송신이 실패하면 등록하지 않고 에러를 돌려준다.
    pub fn send(
        &mut self,
        mut request: ScpRequest,
        sequence: u16,
        on_success: Option<SuccessCallback<'a>>,
        on_error: Option<ErrorCallback<'a>>,
    ) -> Result<()> {
        let datagram = {
            request.sequence = Some(sequence);
            request.encode(self.config.default_sdp_tag)?
        };

        let n_channels = self.config.n_channels.max(1);
        while self.outstanding.len() >= n_channels {
            self.retrieve_until(self.config.intermediate_channel_waits.min(n_channels - 1));
        }

        self.dispatcher.register(sequence, self.inbox_tx.clone())?;
        if let Err(e) = self.dispatcher.connection().send_scp(&datagram) {
            self.dispatcher.unregister(sequence);
            return Err(e);
        }
        self.stats.requests += 1;
        self.outstanding.insert(
            sequence,
            Outstanding {
                request,
                datagram,
                sends_remaining: self.config.n_retries.max(1) - 1,
                retry_reasons: Vec::new(),
                sent_at: Instant::now(),
                on_success,
                on_error,
            },
        );
        Ok(())
    }

    /// 모든 요청이 해결될 때까지 수신
    pub fn finish(&mut self) {
        self.retrieve_until(0);
    }

    /// 미해결 요청이 `n` 이하가 될 때까지 수신
    fn retrieve_until(&mut self, n: usize) {
        while self.outstanding.len() > n {
            match self.dispatcher.receive(&self.inbox, self.config.scp_timeout) {
                Ok(datagram) => self.handle_datagram(datagram),
                Err(e) if e.is_timeout() => self.handle_timeout(),
                Err(e) => {
                    warn!("수신 실패, 미해결 요청 {}개 실패 처리: {}", self.outstanding.len(), e);
                    let sequences: Vec<u16> = self.outstanding.keys().copied().collect();
                    for sequence in sequences {
                        self.fail(sequence, e.clone());
                    }
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Bytes) {
        let response = match ScpResponse::decode(datagram.clone()) {
            Ok(response) => response,
            Err(e) => {
                self.handle_undecodable(&datagram, e);
                return;
            }
        };

        let sequence = response.sequence;
        let Some(entry) = self.outstanding.get(&sequence) else {
            self.stats.n_stale += 1;
            debug!("미해결 요청이 없는 응답 무시: seq={}", sequence);
            return;
        };

        let result = response.result;
        if entry.request.accepts(result) {
            if let Some(entry) = self.take(sequence) {
                self.stats.responses += 1;
                self.stats.record_response(entry.sent_at.elapsed());
                if let Some(on_success) = entry.on_success {
                    if let Err(e) = on_success(&response) {
                        self.report(entry.request, entry.on_error, e);
                    }
                }
            }
        } else if result.is_retry_code() {
            debug!("재시도 결과 코드 {:?}: seq={}", result, sequence);
            thread::sleep(self.config.retry_code_delay);
            self.resend(sequence, Resend::RetryCode, format!("{:?}", result));
        } else if result == ScpResult::Buf {
            let error = Error::AllocationFailure(format!(
                "{} ({:?})",
                entry.request.operation, entry.request.command
            ));
            self.fail(sequence, error);
        } else {
            let error = unexpected(&entry.request, result as u16, Some(result));
            self.fail(sequence, error);
        }
    }

    /// 결과 코드를 알 수 없는 응답은 주인 요청의 실패로 기록
    fn handle_undecodable(&mut self, datagram: &[u8], error: Error) {
        let Ok((code, sequence)) = ScpResponse::peek(datagram) else {
            warn!("잘못된 응답 무시: {}", error);
            return;
        };
        let Some(entry) = self.outstanding.get(&sequence) else {
            warn!("잘못된 응답 무시: seq={}, {}", sequence, error);
            return;
        };
        warn!("알 수 없는 결과 코드 0x{:x}: seq={}", code, sequence);
        let error = unexpected(&entry.request, code, None);
        self.fail(sequence, error);
    }

    fn handle_timeout(&mut self) {
        self.stats.n_timeouts += 1;
        let mut sequences: Vec<u16> = self.outstanding.keys().copied().collect();
        sequences.sort_unstable();
        debug!("수신 타임아웃, {}개 재전송", sequences.len());
        for sequence in sequences {
            self.resend(sequence, Resend::Timeout, TIMEOUT_REASON.to_string());
        }
    }

    /// 같은 데이터그램 재전송; 예산이 없으면 실패 처리
    fn resend(&mut self, sequence: u16, kind: Resend, reason: String) {
        let Some(entry) = self.outstanding.get_mut(&sequence) else {
            return;
        };
        entry.retry_reasons.push(reason);

        if entry.sends_remaining == 0 {
            let error = if entry.retry_reasons.iter().all(|r| r == TIMEOUT_REASON) {
                Error::Timeout {
                    operation: entry.request.operation.to_string(),
                    timeout: self.config.scp_timeout,
                }
            } else {
                let header = &entry.request.sdp_header;
                Error::IoProblem(format!(
                    "{} 요청을 {},{},{} 로 {}회 보냈으나 실패: {:?}",
                    entry.request.operation,
                    header.destination_chip_x,
                    header.destination_chip_y,
                    header.destination_cpu,
                    self.config.n_retries,
                    entry.retry_reasons
                ))
            };
            self.fail(sequence, error);
            return;
        }

        entry.sends_remaining -= 1;
        entry.sent_at = Instant::now();
        let datagram = entry.datagram.clone();
        match kind {
            Resend::Timeout => self.stats.n_resent += 1,
            Resend::RetryCode => self.stats.n_retry_code_resent += 1,
        }
        if let Err(e) = self.dispatcher.connection().send_scp(&datagram) {
            self.fail(sequence, e);
        }
    }

    /// 미해결 목록과 분배기에서 함께 제거
    fn take(&mut self, sequence: u16) -> Option<Outstanding<'a>> {
        let entry = self.outstanding.remove(&sequence)?;
        self.dispatcher.unregister(sequence);
        Some(entry)
    }

    fn fail(&mut self, sequence: u16, error: Error) {
        if let Some(entry) = self.take(sequence) {
            self.report(entry.request, entry.on_error, error);
        }
    }

    fn report(&mut self, request: ScpRequest, on_error: Option<ErrorCallback<'a>>, error: Error) {
        debug!("요청 실패 ({}): {}", request.operation, error);
        if let Some(on_error) = on_error {
            on_error(&request, &error);
        }
        self.failures.push(Failure { request, error });
    }
}

impl Drop for ScpPipeline<'_> {
    fn drop(&mut self) {
        for sequence in self.outstanding.keys() {
            self.dispatcher.unregister(*sequence);
        }
    }
}

fn unexpected(request: &ScpRequest, code: u16, result: Option<ScpResult>) -> Error {
    Error::UnexpectedResponseCode {
        operation: request.operation.to_string(),
        command: format!("{:?}", request.command),
        code,
        result,
    }
}
