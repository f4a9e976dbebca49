//! 다중 연결 SCP 프로세스
//!
//! 요청마다 선택자로 연결을 고르고, 연결별 파이프라인에 맡긴다.
//! 한 요청의 실패는 다른 요청을 멈추지 않으며, 첫 에러만 보고한다.
//!
//! ```text
//! send() ... send() -> finish() -> check_for_error()
//! ```

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, error};

use crate::config::Config;
use crate::dispatch::{connection_key, Dispatchers};
use crate::error::{Error, Result};
use crate::pipeline::{ErrorCallback, Failure, ScpPipeline, SuccessCallback};
use crate::scp::{ScpRequest, ScpResponse, SequenceGenerator};
use crate::selector::ConnectionSelector;
use crate::stats::ProcessStats;

/// 요청 묶음 하나를 처리하는 프로세스
///
/// `finish()` 이후에는 다시 쓸 수 없다. 여러 스레드에서 동시에 `send` 하면 안 된다.
/// 같은 연결을 쓰는 다른 프로세스와는 [`Dispatchers`] 를 공유해야 응답이 섞이지 않는다.
pub struct ScpProcess<'a> {
    selector: Arc<dyn ConnectionSelector>,
    config: Config,
    sequences: Arc<SequenceGenerator>,
    dispatchers: Arc<Dispatchers>,
    /// (연결 포인터 주소, 파이프라인)
    pipelines: Vec<(usize, ScpPipeline<'a>)>,
    failures: Vec<Failure>,
    finished: bool,
}

impl<'a> ScpProcess<'a> {
    /// 새 프로세스 생성 (자체 시퀀스 발급기 사용)
    pub fn new(selector: Arc<dyn ConnectionSelector>, config: Config) -> Self {
        Self::with_sequences(selector, config, Arc::new(SequenceGenerator::new()))
    }

    /// 주어진 시퀀스 발급기를 쓰는 프로세스
    pub fn with_sequences(
        selector: Arc<dyn ConnectionSelector>,
        config: Config,
        sequences: Arc<SequenceGenerator>,
    ) -> Self {
        Self::shared(selector, config, sequences, Arc::new(Dispatchers::new()))
    }

    /// 세션 공용 시퀀스 발급기와 응답 분배기를 쓰는 프로세스
    pub fn shared(
        selector: Arc<dyn ConnectionSelector>,
        config: Config,
        sequences: Arc<SequenceGenerator>,
        dispatchers: Arc<Dispatchers>,
    ) -> Self {
        Self {
            selector,
            config,
            sequences,
            dispatchers,
            pipelines: Vec::new(),
            failures: Vec::new(),
            finished: false,
        }
    }

    /// 요청 송신
    ///
    /// 요청에 시퀀스가 없으면 발급기에서 이 프로세스와 고른 연결 어디에서도
    /// 미해결이 아닌 번호를 받는다.
    /// 로컬 검증 실패나 송신 I/O 실패는 바로 돌려준다.
    pub fn send(
        &mut self,
        request: ScpRequest,
        on_success: Option<SuccessCallback<'a>>,
        on_error: Option<ErrorCallback<'a>>,
    ) -> Result<()> {
        if self.finished {
            return Err(Error::Closed);
        }
        request.validate()?;

        let connection = self.selector.select(&request);
        let key = connection_key(&connection);
        let index = match self.pipelines.iter().position(|(k, _)| *k == key) {
            Some(index) => index,
            None => {
                debug!("파이프라인 생성: {:?}", connection);
                let dispatcher = self.dispatchers.for_connection(&connection);
                self.pipelines
                    .push((key, ScpPipeline::new(dispatcher, self.config.clone())));
                self.pipelines.len() - 1
            }
        };

        let sequence = match request.sequence {
            Some(sequence) if self.is_taken(index, sequence) => {
                return Err(Error::invalid_parameter(
                    "sequence",
                    sequence,
                    "아직 응답을 기다리는 시퀀스",
                ));
            }
            Some(sequence) => sequence,
            None => self.next_free_sequence(index),
        };

        let pipeline = &mut self.pipelines[index].1;
        let result = pipeline.send(request, sequence, on_success, on_error);
        let failures = pipeline.take_failures();
        self.failures.extend(failures);
        result
    }

    /// 응답 또는 에러가 정확히 한 번 도착하는 채널로 송신
    pub fn send_for_reply(&mut self, request: ScpRequest) -> Result<Receiver<Result<ScpResponse>>> {
        let (tx, rx) = bounded(1);
        let error_tx = tx.clone();
        self.send(
            request,
            Some(Box::new(move |response: &ScpResponse| {
                let _ = tx.send(Ok(response.clone()));
                Ok(())
            })),
            Some(Box::new(move |_: &ScpRequest, e: &Error| {
                let _ = error_tx.try_send(Err(e.clone()));
            })),
        )?;
        Ok(rx)
    }

    /// 모든 미해결 요청이 해결될 때까지 대기 (한 번만)
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::Closed);
        }
        self.finished = true;
        for (_, pipeline) in &mut self.pipelines {
            pipeline.finish();
            self.failures.extend(pipeline.take_failures());
        }
        Ok(())
    }

    /// 첫 번째 에러 보고 (여러 번 호출해도 같은 결과)
    pub fn check_for_error(&self) -> Result<()> {
        let Some(first) = self.failures.first() else {
            return Ok(());
        };
        let header = &first.request.sdp_header;
        error!(
            "요청 실패 ({}): chip=({}, {}), cpu={}, 에러={}, 그 외 실패 {}건",
            first.request.operation,
            header.destination_chip_x,
            header.destination_chip_y,
            header.destination_cpu,
            first.error,
            self.failures.len() - 1
        );
        Err(first.error.clone())
    }

    /// `finish` 후 `check_for_error`
    pub fn finish_and_check(&mut self) -> Result<()> {
        self.finish()?;
        self.check_for_error()
    }

    /// 요청 하나를 보내고 응답을 기다림
    pub fn execute(mut self, request: ScpRequest) -> Result<ScpResponse> {
        let reply = self.send_for_reply(request)?;
        self.finish_and_check()?;
        reply.try_recv().map_err(|_| Error::Closed)?
    }

    /// 에러가 있었는지
    pub fn is_error(&self) -> bool {
        !self.failures.is_empty()
    }

    /// 기록된 모든 실패
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> ProcessStats {
        let mut stats = ProcessStats::new();
        stats.pipelines = self
            .pipelines
            .iter()
            .map(|(_, pipeline)| pipeline.stats().clone())
            .collect();
        stats.n_errors = self.failures.len() as u64;
        stats
    }

    fn is_outstanding(&self, sequence: u16) -> bool {
        self.pipelines
            .iter()
            .any(|(_, pipeline)| pipeline.is_outstanding(sequence))
    }

    fn is_taken(&self, index: usize, sequence: u16) -> bool {
        self.is_outstanding(sequence) || self.pipelines[index].1.is_sequence_taken(sequence)
    }

    fn next_free_sequence(&self, index: usize) -> u16 {
        loop {
            let sequence = self.sequences.next();
            if !self.is_taken(index, sequence) {
                return sequence;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    use crate::connection::ScpConnection;
    use crate::scp::{ScpCommand, ScpResult, SdpFlag, SdpHeader};
    use crate::selector::{FixedConnectionSelector, RoundRobinConnectionSelector};
    use crate::testing::{MockConnection, Reply};

    fn fast_config(n_retries: u32) -> Config {
        Config::default()
            .with_timeout(Duration::from_millis(5))
            .with_retries(n_retries)
    }

    fn request_to(x: u8, y: u8) -> ScpRequest {
        ScpRequest::new(
            SdpHeader::to_monitor(x, y, SdpFlag::ReplyExpected),
            ScpCommand::Ver,
            [0; 3],
        )
    }

    fn fixed(mock: &Arc<MockConnection>) -> Arc<dyn ConnectionSelector> {
        let connection: Arc<dyn ScpConnection> = mock.clone();
        Arc::new(FixedConnectionSelector::new(connection))
    }

    #[test]
    fn test_two_timeouts_then_success() {
        let mock = Arc::new(MockConnection::scripted((0, 0), vec![Reply::Drop, Reply::Drop]));
        let mut process = ScpProcess::new(fixed(&mock), fast_config(3));

        let reply = process.send_for_reply(request_to(0, 0)).unwrap();
        process.finish().unwrap();
        process.check_for_error().unwrap();

        assert_eq!(reply.try_recv().unwrap().unwrap().result, ScpResult::Ok);
        assert_eq!(mock.sent_count(), 3);
        let sent = mock.sent();
        assert!(sent.iter().all(|r| r.sequence == sent[0].sequence));
        assert_eq!(process.stats().n_resent(), 2);
    }

    #[test]
    fn test_retry_exhaustion_is_timeout() {
        let mock = Arc::new(MockConnection::scripted(
            (0, 0),
            std::iter::repeat(Reply::Drop).take(10),
        ));
        let mut process = ScpProcess::new(fixed(&mock), fast_config(2));
        process.send(request_to(0, 0), None, None).unwrap();
        process.finish().unwrap();

        let error = process.check_for_error().unwrap_err();
        assert!(error.is_timeout());
        assert_eq!(mock.sent_count(), 2);
        // 같은 에러를 다시 돌려준다
        assert!(process.check_for_error().unwrap_err().is_timeout());
    }

    #[test]
    fn test_failure_does_not_stop_siblings() {
        let mock = Arc::new(MockConnection::scripted(
            (0, 0),
            vec![
                Reply::Result(ScpResult::Ok),
                Reply::Result(ScpResult::Cpu),
                Reply::Result(ScpResult::Ok),
            ],
        ));
        let completed = RefCell::new(Vec::new());
        let mut process = ScpProcess::new(fixed(&mock), fast_config(3));
        for i in 0..3u8 {
            let completed = &completed;
            process
                .send(
                    request_to(i, 0),
                    Some(Box::new(move |_: &ScpResponse| {
                        completed.borrow_mut().push(i);
                        Ok(())
                    })),
                    None,
                )
                .unwrap();
        }
        process.finish().unwrap();

        assert!(matches!(
            process.check_for_error(),
            Err(Error::UnexpectedResponseCode {
                result: Some(ScpResult::Cpu),
                ..
            })
        ));
        assert_eq!(process.failures().len(), 1);
        assert_eq!(process.failures()[0].request.sdp_header.destination_chip_x, 1);
        assert_eq!(*completed.borrow(), vec![0, 2]);
    }

    #[test]
    fn test_sequence_skips_outstanding() {
        let mock = Arc::new(MockConnection::scripted((0, 0), vec![Reply::Drop, Reply::Drop]));
        let sequences = Arc::new(SequenceGenerator::starting_at(7));
        let mut process =
            ScpProcess::with_sequences(fixed(&mock), fast_config(3), sequences.clone());

        process.send(request_to(0, 0), None, None).unwrap();
        // 7 은 미해결이므로 명시적으로 재사용할 수 없다
        let result = process.send(request_to(0, 0).with_sequence(7), None, None);
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));

        // 발급기를 한 바퀴 돌려 7 을 다시 내놓게 해도 건너뛴다
        for _ in 0..(65536 - 1) {
            sequences.next();
        }
        process.send(request_to(0, 0), None, None).unwrap();
        let sent = mock.sent();
        assert_eq!(sent[0].sequence, Some(7));
        assert_eq!(sent[1].sequence, Some(8));
        process.finish_and_check().unwrap();
    }

    #[test]
    fn test_send_after_finish() {
        let mock = Arc::new(MockConnection::new((0, 0)));
        let mut process = ScpProcess::new(fixed(&mock), fast_config(3));
        process.finish().unwrap();
        assert!(matches!(
            process.send(request_to(0, 0), None, None),
            Err(Error::Closed)
        ));
        assert!(matches!(process.finish(), Err(Error::Closed)));
    }

    #[test]
    fn test_pipelines_per_connection() {
        let a = Arc::new(MockConnection::new((0, 0)));
        let b = Arc::new(MockConnection::new((4, 8)));
        let connections: Vec<Arc<dyn ScpConnection>> = vec![a.clone(), b.clone()];
        let selector = Arc::new(RoundRobinConnectionSelector::new(connections).unwrap());
        let mut process = ScpProcess::new(selector, fast_config(3));
        for _ in 0..4 {
            process.send(request_to(0, 0), None, None).unwrap();
        }
        process.finish_and_check().unwrap();

        assert_eq!(a.sent_count(), 2);
        assert_eq!(b.sent_count(), 2);
        assert_eq!(process.stats().pipelines.len(), 2);
        assert_eq!(process.stats().requests(), 4);
    }

    #[test]
    fn test_processes_share_connection() {
        let mock = Arc::new(MockConnection::scripted(
            (0, 0),
            vec![
                Reply::Data(ScpResult::Ok, vec![1]),
                Reply::Data(ScpResult::Ok, vec![2]),
            ],
        ));
        let sequences = Arc::new(SequenceGenerator::new());
        let dispatchers = Arc::new(Dispatchers::new());
        let mut first =
            ScpProcess::shared(fixed(&mock), fast_config(1), sequences.clone(), dispatchers.clone());
        let mut second =
            ScpProcess::shared(fixed(&mock), fast_config(1), sequences, dispatchers.clone());

        let first_reply = first.send_for_reply(request_to(0, 0)).unwrap();
        let second_reply = second.send_for_reply(request_to(0, 0)).unwrap();
        // 두 번째가 먼저 기다리면서 첫 번째의 응답도 읽게 된다
        second.finish_and_check().unwrap();
        first.finish_and_check().unwrap();

        assert_eq!(first_reply.try_recv().unwrap().unwrap().payload(), &[1]);
        assert_eq!(second_reply.try_recv().unwrap().unwrap().payload(), &[2]);
        assert_eq!(dispatchers.n_stale(), 0);
        assert_eq!(mock.sent_count(), 2);
    }

    #[test]
    fn test_sequence_in_use_by_other_process() {
        let mock = Arc::new(MockConnection::scripted((0, 0), vec![Reply::Drop]));
        let dispatchers = Arc::new(Dispatchers::new());
        let mut first = ScpProcess::shared(
            fixed(&mock),
            fast_config(3),
            Arc::new(SequenceGenerator::starting_at(40)),
            dispatchers.clone(),
        );
        let mut second = ScpProcess::shared(
            fixed(&mock),
            fast_config(3),
            Arc::new(SequenceGenerator::starting_at(40)),
            dispatchers,
        );

        first.send(request_to(0, 0), None, None).unwrap();
        let explicit = second.send(request_to(0, 0).with_sequence(40), None, None);
        assert!(matches!(explicit, Err(Error::InvalidParameter { .. })));
        // 발급기가 40 을 내놓아도 건너뛴다
        second.send(request_to(0, 0), None, None).unwrap();
        assert_eq!(mock.sent()[1].sequence, Some(41));

        second.finish_and_check().unwrap();
        first.finish_and_check().unwrap();
    }

    #[test]
    fn test_execute_single_request() {
        let mock = Arc::new(MockConnection::scripted(
            (0, 0),
            vec![Reply::Data(ScpResult::Ok, 12u32.to_le_bytes().to_vec())],
        ));
        let response = ScpProcess::new(fixed(&mock), fast_config(3))
            .execute(request_to(0, 0))
            .unwrap();
        assert_eq!(response.first_word().unwrap(), 12);
    }
}
