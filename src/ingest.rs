use crate::engine::FlushEngine;
use crate::error::AppendError;
use crate::record::Normalizer;
use crate::sink::PersistenceSink;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: u64,
    pub rejected: u64,
}

/// Drain the device channel into the engine until the channel closes or `cancel` fires.
///
/// Values that fail validation are logged and dropped; the stream keeps going.
pub async fn run_ingest<S: PersistenceSink>(
    mut rx: mpsc::Receiver<Bytes>,
    normalizer: Normalizer,
    engine: FlushEngine<S>,
    cancel: CancellationToken,
) -> IngestSummary {
    let mut summary = IngestSummary::default();

    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(payload) => payload,
                None => break,
            },
        };

        let mut bytes = payload.to_vec();
        let record = match normalizer.normalize_payload(&mut bytes) {
            Ok(record) => record,
            Err(err) => {
                summary.rejected += 1;
                tracing::warn!(error=%err, len = payload.len(), "dropping invalid brainwave record");
                continue;
            }
        };

        tracing::debug!(
            channels = record.channel_count(),
            timestamp = %record.timestamp,
            "received brainwave record"
        );

        if let Err(AppendError::Closed(record)) = engine.append(record) {
            tracing::warn!(timestamp = %record.timestamp, "flush engine closed; stopping ingest");
            break;
        }
        summary.accepted += 1;
    }

    tracing::info!(
        accepted = summary.accepted,
        rejected = summary.rejected,
        "ingest loop finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlushPolicy;
    use crate::sink::SqliteSink;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn malformed_record_is_dropped_and_rest_are_persisted() {
        let dir = TempDir::new().unwrap();
        let sink = SqliteSink::open(&dir.path().join("recorder.db"), 2)
            .await
            .unwrap();
        let engine = FlushEngine::start(sink, FlushPolicy::new(2, Duration::from_secs(3600)));

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let task = tokio::spawn(run_ingest(
            rx,
            Normalizer::new("grace"),
            engine.clone(),
            CancellationToken::new(),
        ));

        let payloads: [&[u8]; 5] = [
            br#"{"timestamp":"2024-01-01T00:00:01Z","data":[[1.0,2.0]]}"#,
            br#"{"timestamp":"2024-01-01T00:00:02Z","data":[[3.0,4.0]]}"#,
            b"\x00\x01 definitely not json",
            br#"{"timestamp":"2024-01-01T00:00:03Z","data":[[5.0,6.0]]}"#,
            br#"{"data":[[7.0,8.0]]}"#,
        ];
        for payload in payloads {
            tx.send(Bytes::from_static(payload)).await.unwrap();
        }
        drop(tx);

        let summary = task.await.unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                accepted: 4,
                rejected: 1
            }
        );

        engine.shutdown().await.unwrap();
        // shutdown closes the engine's pool; reopen the file to inspect what landed.
        let reopened = SqliteSink::open(&dir.path().join("recorder.db"), 1)
            .await
            .unwrap();
        assert_eq!(reopened.count().await.unwrap(), 4);
        let rows = reopened.recent(10).await.unwrap();
        assert!(rows.iter().all(|row| row.user_name == "grace"));
        assert_eq!(rows[0].timestamp.len(), "2024-01-01T00:00:00.000000Z".len());
        assert!(rows[0].data.contains(&rows[0].timestamp));
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let sink = SqliteSink::open(&dir.path().join("recorder.db"), 1)
            .await
            .unwrap();
        let engine = FlushEngine::start(sink, FlushPolicy::new(10, Duration::from_secs(3600)));
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_ingest(rx, Normalizer::new("grace"), engine.clone(), cancel.clone()));

        cancel.cancel();
        let summary = task.await.unwrap();
        assert_eq!(summary, IngestSummary::default());
        drop(tx);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_engine_is_closed() {
        let dir = TempDir::new().unwrap();
        let sink = SqliteSink::open(&dir.path().join("recorder.db"), 1)
            .await
            .unwrap();
        let engine = FlushEngine::start(sink, FlushPolicy::new(10, Duration::from_secs(3600)));
        engine.shutdown().await.unwrap();

        let (tx, rx) = mpsc::channel::<Bytes>(4);
        tx.send(Bytes::from_static(br#"{"data":[]}"#)).await.unwrap();
        let summary = run_ingest(rx, Normalizer::new("grace"), engine, CancellationToken::new()).await;
        assert_eq!(summary.accepted, 0);
    }
}
