use super::*;
use crate::testing::{ChannelTail, Outcome, ScriptedTail, scripted, source_id};
use crate::types::SourceState;
use std::time::Duration;

fn config(buffer: usize) -> AggregatorConfig {
    AggregatorConfig {
        buffer,
        end_on_exhaustion: true,
        all_or_nothing: false,
    }
}

async fn drain(rx: &mut mpsc::Receiver<LogRecord>) -> Vec<LogRecord> {
    let mut out = Vec::new();
    while let Some(record) = rx.recv().await {
        out.push(record);
    }
    out
}

fn messages(records: &[LogRecord], pod: &str) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.source.pod_name() == pod)
        .map(|r| r.message.clone())
        .collect()
}

#[tokio::test]
async fn single_source_order_is_preserved() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, config(2));

    let lines: Vec<String> = (1..=50).map(|i| format!("R{i}")).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    assert!(agg.add(scripted("web-1", &refs, Outcome::Exhaust)).await.unwrap());

    let records = drain(&mut rx).await;
    assert_eq!(messages(&records, "web-1"), lines);
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
    assert!(agg.err().is_none());
}

#[tokio::test]
async fn failing_source_does_not_stop_healthy_one() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, config(4));

    // Keeps the aggregate open until every source has been added.
    let (keeper, keeper_rx) = mpsc::channel(1);
    agg.add(StreamSource::new(source_id("keeper"), ChannelTail { rx: keeper_rx }))
        .await
        .unwrap();
    agg.add(scripted("broken", &[], Outcome::Fail("node unreachable")))
        .await
        .unwrap();
    agg.add(scripted("web-1", &["a", "b", "c"], Outcome::Exhaust))
        .await
        .unwrap();
    drop(keeper);

    let records = drain(&mut rx).await;
    assert_eq!(messages(&records, "web-1"), vec!["a", "b", "c"]);

    let err = agg.err().expect("failure must be observable");
    assert!(err.to_string().contains("node unreachable"), "{err}");
    let failures = agg.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, source_id("broken"));
}

#[tokio::test]
async fn all_or_nothing_closes_on_first_failure() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(
        &cancel,
        AggregatorConfig {
            buffer: 4,
            end_on_exhaustion: false,
            all_or_nothing: true,
        },
    );

    let healthy = scripted("web-1", &[], Outcome::Hang);
    let healthy_handle = healthy.handle();
    agg.add(healthy).await.unwrap();
    agg.add(scripted("broken", &[], Outcome::Fail("rotated away")))
        .await
        .unwrap();

    assert!(drain(&mut rx).await.is_empty());
    agg.closed().await;
    assert!(agg.is_closed());
    assert!(agg.err().is_some());
    assert_eq!(healthy_handle.state(), SourceState::Closed);
}

#[tokio::test]
async fn discovery_failure_is_observable() {
    let cancel = CancellationToken::new();
    let (agg, _rx) = Aggregator::new(
        &cancel,
        AggregatorConfig {
            buffer: 4,
            end_on_exhaustion: false,
            all_or_nothing: false,
        },
    );
    agg.add(scripted("web-1", &[], Outcome::Hang)).await.unwrap();

    agg.fail(source_id("*"), Error::source_failed("default/pods", "403 forbidden"));
    let err = agg.err().expect("failure must be observable");
    assert!(err.to_string().contains("403 forbidden"), "{err}");
    assert_eq!(agg.failures()[0].0, source_id("*"));
    assert!(!agg.is_closed());
    assert_eq!(agg.len(), 1);
    agg.close().await;

    let (agg, mut rx) = Aggregator::new(
        &cancel,
        AggregatorConfig {
            buffer: 4,
            end_on_exhaustion: false,
            all_or_nothing: true,
        },
    );
    agg.add(scripted("web-1", &[], Outcome::Hang)).await.unwrap();
    agg.fail(source_id("*"), Error::source_failed("default/pods", "watch gave up"));
    assert!(drain(&mut rx).await.is_empty());
    agg.closed().await;
    assert!(agg.err().unwrap().to_string().contains("watch gave up"));
}

#[tokio::test]
async fn open_failure_is_recorded() {
    let cancel = CancellationToken::new();
    let (agg, _rx) = Aggregator::new(&cancel, AggregatorConfig::default());

    let mut tail = ScriptedTail::new(&[], Outcome::Exhaust);
    tail.open_error = Some("permission denied on file");
    let err = agg
        .add(StreamSource::new(source_id("web-1"), tail))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("permission denied on file"));
    assert!(agg.err().is_some());
    assert!(agg.is_empty());
    agg.close().await;
}

#[tokio::test]
async fn sources_join_and_leave_while_streaming() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, AggregatorConfig::default());

    let (tx1, rx1) = mpsc::channel(8);
    agg.add(StreamSource::new(source_id("web-1"), ChannelTail { rx: rx1 }))
        .await
        .unwrap();
    tx1.send("first".to_string()).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().message, "first");

    let (tx2, rx2) = mpsc::channel(8);
    agg.add(StreamSource::new(source_id("web-2"), ChannelTail { rx: rx2 }))
        .await
        .unwrap();
    assert_eq!(agg.sources(), vec![source_id("web-1"), source_id("web-2")]);

    tx2.send("second".to_string()).await.unwrap();
    let record = rx.recv().await.unwrap();
    assert_eq!(record.message, "second");
    assert_eq!(record.source.pod_name(), "web-2");

    assert!(agg.remove(&source_id("web-1")));
    assert!(!agg.remove(&source_id("web-1")));
    assert_eq!(agg.sources(), vec![source_id("web-2")]);

    tx2.send("third".to_string()).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().message, "third");
    assert!(!agg.is_closed());

    agg.close().await;
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn duplicate_sources_are_rejected() {
    let cancel = CancellationToken::new();
    let (agg, _rx) = Aggregator::new(&cancel, AggregatorConfig::default());

    assert!(agg.add(scripted("web-1", &[], Outcome::Hang)).await.unwrap());
    assert!(!agg.add(scripted("web-1", &[], Outcome::Hang)).await.unwrap());
    assert_eq!(agg.len(), 1);
    agg.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_new_members() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, AggregatorConfig::default());
    agg.add(scripted("web-1", &["a"], Outcome::Hang)).await.unwrap();

    agg.close().await;
    agg.close().await;
    assert!(agg.is_closed());
    assert!(drain(&mut rx).await.len() <= 1);

    let err = agg.add(scripted("web-2", &[], Outcome::Hang)).await.unwrap_err();
    assert!(matches!(err, Error::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adds_racing_close_never_outlive_it() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, AggregatorConfig::default());

    let adds: Vec<_> = (0..32)
        .map(|i| {
            let agg = agg.clone();
            tokio::spawn(async move {
                agg.add(scripted(&format!("web-{i}"), &["x"], Outcome::Hang))
                    .await
            })
        })
        .collect();
    agg.close().await;

    for add in adds {
        match add.await.unwrap() {
            Ok(_) | Err(Error::Closed) => {}
            Err(err) => panic!("unexpected add error: {err}"),
        }
    }
    tokio::time::timeout(Duration::from_secs(5), drain(&mut rx))
        .await
        .expect("output stayed open after close");
    assert!(agg.is_closed());
    assert!(matches!(
        agg.add(scripted("late", &[], Outcome::Hang)).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn slow_consumer_gets_backpressure_not_loss() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, config(1));

    let lines: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    agg.add(scripted("web-1", &refs, Outcome::Exhaust).with_buffer(1))
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Some(record) = rx.recv().await {
        tokio::time::sleep(Duration::from_millis(1)).await;
        received.push(record.message);
    }
    assert_eq!(received, lines);
}

#[tokio::test]
async fn lossy_source_drops_under_pressure() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, config(1));

    let lines: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let mut tail = ScriptedTail::new(&refs, Outcome::Exhaust);
    tail.lossy = true;
    agg.add(StreamSource::new(source_id("web-1"), tail))
        .await
        .unwrap();

    agg.closed().await;
    let received = drain(&mut rx).await;
    assert!(!received.is_empty() && received.len() < lines.len());
    assert_eq!(received[0].message, "0");
}

#[tokio::test]
async fn parent_cancellation_closes_everything() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, AggregatorConfig::default());
    let source = scripted("web-1", &[], Outcome::Hang);
    let handle = source.handle();
    agg.add(source).await.unwrap();

    cancel.cancel();
    assert!(rx.recv().await.is_none());
    agg.closed().await;
    assert_eq!(handle.state(), SourceState::Closed);
}

#[tokio::test]
async fn dropping_the_consumer_shuts_down() {
    let cancel = CancellationToken::new();
    let (agg, rx) = Aggregator::new(&cancel, AggregatorConfig::default());
    agg.add(scripted("web-1", &[], Outcome::Hang)).await.unwrap();

    drop(rx);
    agg.closed().await;
    assert!(agg.is_empty());
}

#[tokio::test]
async fn hold_keeps_aggregate_open_while_adding() {
    let cancel = CancellationToken::new();
    let (agg, mut rx) = Aggregator::new(&cancel, config(4));

    let hold = agg.hold();
    agg.add(scripted("web-1", &["a"], Outcome::Exhaust)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().message, "a");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!agg.is_closed());

    agg.add(scripted("web-2", &["b"], Outcome::Exhaust)).await.unwrap();
    drop(hold);

    let records = drain(&mut rx).await;
    assert_eq!(messages(&records, "web-2"), vec!["b"]);
    agg.closed().await;
}
