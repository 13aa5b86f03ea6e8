//! Newline-delimited JSON record formats.
//!
//! Each inbound line is an [`InboundRecord`]: a captured transaction and,
//! optionally, the span the collector produced for it. A line carrying only a
//! span is inspected from the span's `http.*` attributes. Each outbound line
//! is a serialized [`CorrelatedRecord`].

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ocinspect_core::record::{CorrelatedRecord, SpanRecord};
use ocinspect_core::transaction::RawTransaction;

/// One inbound NDJSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRecord {
    pub transaction: RawTransaction,
    #[serde(default)]
    pub span: Option<SpanRecord>,
}

#[derive(Deserialize)]
struct WireRecord {
    #[serde(default)]
    transaction: Option<RawTransaction>,
    #[serde(default)]
    span: Option<SpanRecord>,
}

impl InboundRecord {
    /// Parse one line.
    ///
    /// A span without its own correlation id inherits the transaction's.
    /// Without a transaction, one is rebuilt from the span attributes.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let WireRecord { transaction, span } = serde_json::from_str(line)?;
        let mut record = match (transaction, span) {
            (Some(transaction), span) => Self { transaction, span },
            (None, Some(span)) => Self {
                transaction: RawTransaction::from_span_attributes(
                    span.correlation_id.clone(),
                    span.attributes.clone(),
                ),
                span: Some(span),
            },
            (None, None) => {
                return Err(serde_json::Error::custom(
                    "record carries neither a transaction nor a span",
                ));
            }
        };
        if let Some(span) = record.span.as_mut()
            && span.correlation_id.trim().is_empty()
            && let Some(id) = record.transaction.correlation_id()
        {
            span.correlation_id = id.to_owned();
        }
        Ok(record)
    }
}

/// Spawn the task that writes correlated records as NDJSON.
///
/// The task ends when every sender of `records` is dropped and returns the
/// writer together with the number of lines written.
pub fn spawn_record_writer<W>(
    mut records: mpsc::Receiver<CorrelatedRecord>,
    mut output: W,
) -> JoinHandle<std::io::Result<(W, u64)>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(record) = records.recv().await {
            let mut line = match serde_json::to_vec(&record) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(
                        correlation_id = %record.correlation_id(),
                        error = %e,
                        "failed to serialize correlated record"
                    );
                    continue;
                }
            };
            line.push(b'\n');
            output.write_all(&line).await?;
            written += 1;
            tracing::trace!(record = %record, "record written");
        }
        output.flush().await?;
        Ok((output, written))
    })
}
