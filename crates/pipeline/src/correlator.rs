//! 결과 상관기 -- 검사 결과를 스팬에 붙이거나 독립 레코드로 내보냄
//!
//! 스팬은 [`register_span`](FindingCorrelator::register_span)으로 등록되어
//! `span_hold` 동안 보류됩니다. 그 안에 결과가 도착하면 결과 속성이 붙은
//! 스팬(`EnrichedSpan`)을 내보내고, 보류 시간이 지나면 스팬을 그대로 전달합니다.
//! 스팬이 이미 전달된 뒤 도착한 결과는 상관 ID를 참조하는 독립 레코드가 됩니다.
//!
//! 상관 ID마다 `attach`는 한 번만 허용됩니다. 붙인 ID는 `attached_retention`
//! 동안 기억하여 중복 호출을 거부합니다.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ocinspect_core::error::CorrelationError;
use ocinspect_core::finding::InspectionOutcome;
use ocinspect_core::metrics as m;
use ocinspect_core::record::{CorrelatedRecord, SpanRecord, StandaloneFindings};

use crate::config::PipelineConfig;

/// 스위퍼 최소 주기
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct PendingSpan {
    span: SpanRecord,
    registered_at: Instant,
}

/// 검사 결과 상관기
#[derive(Debug)]
pub struct FindingCorrelator {
    span_hold: Duration,
    attached_retention: Duration,
    pending: DashMap<String, PendingSpan>,
    attached: DashMap<String, Instant>,
    output: mpsc::Sender<CorrelatedRecord>,
}

impl FindingCorrelator {
    /// 상관기와 하류 레코드 수신기를 생성합니다.
    pub fn new(
        span_hold: Duration,
        attached_retention: Duration,
        output_capacity: usize,
    ) -> (Self, mpsc::Receiver<CorrelatedRecord>) {
        let (output, rx) = mpsc::channel(output_capacity.max(1));
        (Self::with_output(span_hold, attached_retention, output), rx)
    }

    /// 외부 하류 채널로 레코드를 내보내는 상관기를 생성합니다.
    pub fn with_output(
        span_hold: Duration,
        attached_retention: Duration,
        output: mpsc::Sender<CorrelatedRecord>,
    ) -> Self {
        Self {
            span_hold,
            attached_retention,
            pending: DashMap::new(),
            attached: DashMap::new(),
            output,
        }
    }

    /// 파이프라인 설정으로 상관기를 생성합니다.
    pub fn from_config(config: &PipelineConfig) -> (Self, mpsc::Receiver<CorrelatedRecord>) {
        Self::new(
            config.span_hold(),
            config.attached_retention(),
            config.output_capacity,
        )
    }

    /// 보류 중인 스팬 수
    pub fn pending_spans(&self) -> usize {
        self.pending.len()
    }

    /// 결과가 붙은 것으로 기억하는 상관 ID 수
    pub fn attached_ids(&self) -> usize {
        self.attached.len()
    }

    /// 스팬을 등록합니다.
    ///
    /// 해당 상관 ID의 결과가 이미 붙어 있으면 스팬을 바로 전달합니다.
    /// 같은 ID로 보류 중인 스팬이 있으면 이전 스팬을 먼저 전달합니다.
    ///
    /// # Errors
    /// 하류 채널이 닫혔으면 `CorrelationError::OutputClosed`
    pub async fn register_span(&self, span: SpanRecord) -> Result<(), CorrelationError> {
        if self.attached.contains_key(&span.correlation_id) {
            debug!(
                correlation_id = %span.correlation_id,
                "findings already emitted, forwarding span"
            );
            return self.emit(CorrelatedRecord::Span(span)).await;
        }

        let replaced = self.pending.insert(
            span.correlation_id.clone(),
            PendingSpan {
                span,
                registered_at: Instant::now(),
            },
        );
        self.update_pending_gauge();

        if let Some(previous) = replaced {
            warn!(
                correlation_id = %previous.span.correlation_id,
                "span registered twice, forwarding the earlier one"
            );
            self.emit(CorrelatedRecord::Span(previous.span)).await?;
        }
        Ok(())
    }

    /// 검사 결과를 붙입니다.
    ///
    /// # Errors
    /// - 같은 상관 ID로 이미 호출되었으면 `CorrelationError::AlreadyAttached`
    /// - 하류 채널이 닫혔으면 `CorrelationError::OutputClosed`
    pub async fn attach(&self, outcome: InspectionOutcome) -> Result<(), CorrelationError> {
        match self.attached.entry(outcome.correlation_id.clone()) {
            Entry::Occupied(_) => {
                metrics::counter!(m::CORRELATOR_DUPLICATE_ATTACH_TOTAL).increment(1);
                warn!(
                    correlation_id = %outcome.correlation_id,
                    "findings already attached, rejecting duplicate"
                );
                return Err(CorrelationError::AlreadyAttached {
                    correlation_id: outcome.correlation_id,
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }

        let record = match self.pending.remove(&outcome.correlation_id) {
            Some((_, mut pending)) => {
                self.update_pending_gauge();
                pending.span.attach_outcome(&outcome);
                CorrelatedRecord::EnrichedSpan(pending.span)
            }
            None => CorrelatedRecord::Standalone(StandaloneFindings::new(outcome)),
        };
        self.emit(record).await
    }

    /// 보류 시간이 지난 스팬을 전달하고 오래된 상관 ID를 잊습니다.
    ///
    /// 전달한 스팬 수를 반환합니다.
    ///
    /// # Errors
    /// 하류 채널이 닫혔으면 `CorrelationError::OutputClosed`
    pub async fn sweep(&self, now: Instant) -> Result<usize, CorrelationError> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.registered_at) >= self.span_hold)
            .map(|entry| entry.key().clone())
            .collect();

        let mut forwarded = 0;
        for id in expired {
            // attach와 경쟁하면 먼저 꺼낸 쪽이 스팬을 가짐
            if let Some((_, pending)) = self.pending.remove(&id) {
                self.emit(CorrelatedRecord::Span(pending.span)).await?;
                forwarded += 1;
            }
        }

        let retention = self.attached_retention;
        self.attached
            .retain(|_, attached_at| now.saturating_duration_since(*attached_at) < retention);

        if forwarded > 0 {
            self.update_pending_gauge();
            debug!(forwarded, "forwarded spans without findings");
        }
        Ok(forwarded)
    }

    /// 보류 중인 모든 스팬을 그대로 전달합니다. (종료 시)
    ///
    /// # Errors
    /// 하류 채널이 닫혔으면 `CorrelationError::OutputClosed`
    pub async fn flush(&self) -> Result<usize, CorrelationError> {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut forwarded = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                self.emit(CorrelatedRecord::Span(pending.span)).await?;
                forwarded += 1;
            }
        }
        self.update_pending_gauge();
        info!(forwarded, "correlator flushed pending spans");
        Ok(forwarded)
    }

    /// 주기적으로 [`sweep`](Self::sweep)을 실행하는 태스크를 시작합니다.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        let period = (self.span_hold / 2).max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    now = ticker.tick() => {
                        if let Err(e) = correlator.sweep(now).await {
                            warn!(error = %e, "correlator sweeper stopping");
                            break;
                        }
                    }
                }
            }
            debug!("correlator sweeper stopped");
        })
    }

    async fn emit(&self, record: CorrelatedRecord) -> Result<(), CorrelationError> {
        let kind = match &record {
            CorrelatedRecord::EnrichedSpan(_) => "enriched_span",
            CorrelatedRecord::Span(_) => "span",
            CorrelatedRecord::Standalone(_) => "standalone",
        };
        debug!(correlation_id = %record.correlation_id(), kind, "emitting correlated record");
        self.output
            .send(record)
            .await
            .map_err(|_| CorrelationError::OutputClosed)?;
        metrics::counter!(m::CORRELATOR_RECORDS_TOTAL, m::LABEL_KIND => kind).increment(1);
        Ok(())
    }

    fn update_pending_gauge(&self) {
        metrics::gauge!(m::CORRELATOR_PENDING_SPANS).set(self.pending.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocinspect_core::finding::InspectionStatus;
    use ocinspect_core::record::{ATTR_PARTIAL, ATTR_STATUS};

    fn correlator() -> (FindingCorrelator, mpsc::Receiver<CorrelatedRecord>) {
        FindingCorrelator::new(Duration::from_millis(100), Duration::from_secs(60), 16)
    }

    #[tokio::test]
    async fn attach_enriches_pending_span() {
        let (c, mut rx) = correlator();
        c.register_span(SpanRecord::new("tx-1")).await.unwrap();
        assert_eq!(c.pending_spans(), 1);

        let mut outcome = InspectionOutcome::new("tx-1", InspectionStatus::TimedOut);
        outcome.partial = true;
        c.attach(outcome).await.unwrap();

        match rx.recv().await.unwrap() {
            CorrelatedRecord::EnrichedSpan(span) => {
                assert_eq!(span.attributes[ATTR_STATUS], "timed_out");
                assert_eq!(span.attributes[ATTR_PARTIAL], "true");
            }
            other => panic!("unexpected record: {other}"),
        }
        assert_eq!(c.pending_spans(), 0);
    }

    #[tokio::test]
    async fn attach_without_span_is_standalone() {
        let (c, mut rx) = correlator();
        c.attach(InspectionOutcome::new("tx-2", InspectionStatus::Completed))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            CorrelatedRecord::Standalone(s) => {
                assert_eq!(s.correlation_id, "tx-2");
                assert!(!s.record_id.is_empty());
            }
            other => panic!("unexpected record: {other}"),
        }
    }

    #[tokio::test]
    async fn second_attach_is_rejected() {
        let (c, mut rx) = correlator();
        c.attach(InspectionOutcome::new("tx-3", InspectionStatus::Completed))
            .await
            .unwrap();
        let err = c
            .attach(InspectionOutcome::new("tx-3", InspectionStatus::Completed))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CorrelationError::AlreadyAttached {
                correlation_id: "tx-3".to_owned()
            }
        );
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_forwards_expired_spans_then_findings_are_standalone() {
        let (c, mut rx) = correlator();
        c.register_span(SpanRecord::new("tx-4")).await.unwrap();

        let forwarded = c
            .sweep(Instant::now() + Duration::from_millis(150))
            .await
            .unwrap();
        assert_eq!(forwarded, 1);
        assert!(matches!(rx.recv().await, Some(CorrelatedRecord::Span(_))));

        c.attach(InspectionOutcome::new("tx-4", InspectionStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(CorrelatedRecord::Standalone(_))
        ));
    }

    #[tokio::test]
    async fn sweep_keeps_spans_within_hold() {
        let (c, _rx) = correlator();
        c.register_span(SpanRecord::new("tx-5")).await.unwrap();
        assert_eq!(c.sweep(Instant::now()).await.unwrap(), 0);
        assert_eq!(c.pending_spans(), 1);
    }

    #[tokio::test]
    async fn span_after_attach_is_forwarded_immediately() {
        let (c, mut rx) = correlator();
        c.attach(InspectionOutcome::new("tx-6", InspectionStatus::Completed))
            .await
            .unwrap();
        let _standalone = rx.recv().await.unwrap();
        c.register_span(SpanRecord::new("tx-6")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(CorrelatedRecord::Span(_))));
        assert_eq!(c.pending_spans(), 0);
    }

    #[tokio::test]
    async fn retention_expiry_forgets_attached_ids() {
        let (c, _rx) = FindingCorrelator::new(Duration::from_millis(10), Duration::from_secs(1), 16);
        c.attach(InspectionOutcome::new("tx-7", InspectionStatus::Completed))
            .await
            .unwrap();
        assert_eq!(c.attached_ids(), 1);
        c.sweep(Instant::now() + Duration::from_secs(2)).await.unwrap();
        assert_eq!(c.attached_ids(), 0);
    }

    #[tokio::test]
    async fn closed_output_is_reported() {
        let (c, rx) = correlator();
        drop(rx);
        let err = c
            .attach(InspectionOutcome::new("tx-8", InspectionStatus::Completed))
            .await
            .unwrap_err();
        assert_eq!(err, CorrelationError::OutputClosed);
    }

    #[tokio::test]
    async fn flush_forwards_all_pending() {
        let (c, mut rx) = correlator();
        c.register_span(SpanRecord::new("a")).await.unwrap();
        c.register_span(SpanRecord::new("b")).await.unwrap();
        assert_eq!(c.flush().await.unwrap(), 2);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }
}
