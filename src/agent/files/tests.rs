use super::*;
use crate::source::StreamSource;
use crate::types::{LogRecord, SourceId, SourceState};
use std::io::Write;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn log_name(pod: &str, namespace: &str, container: &str) -> String {
    format!("{pod}_{namespace}_{container}-{}.log", "ab".repeat(32))
}

fn write_file(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
}

fn append(path: &Path, contents: &str) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
}

async fn start(path: &Path, tail: FileTail) -> (StreamSource, mpsc::Receiver<LogRecord>) {
    let id = SourceId::new("node-a", "default", "web-1", "app", &path.display().to_string());
    let mut source = StreamSource::new(id, tail);
    source.start(&CancellationToken::new()).await.unwrap();
    let rx = source.records();
    (source, rx)
}

async fn next(rx: &mut mpsc::Receiver<LogRecord>) -> String {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a line")
        .expect("stream ended early")
        .message
}

async fn drain(rx: &mut mpsc::Receiver<LogRecord>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(record) = rx.recv().await {
        out.push(record.message);
    }
    out
}

#[test]
fn log_file_names() {
    let name = log_name("web-7d9f-x2", "shop", "nginx-sidecar");
    let file = LogFile::parse(Path::new(&format!("/var/log/containers/{name}"))).unwrap();
    assert_eq!(file.pod, "web-7d9f-x2");
    assert_eq!(file.namespace, "shop");
    assert_eq!(file.container, "nginx-sidecar");
    assert_eq!(file.container_id, "ab".repeat(32));

    assert!(LogFile::parse(Path::new("/var/log/containers/syslog")).is_none());
    assert!(LogFile::parse(Path::new("/tmp/web_shop_app-1234.log")).is_none());
}

#[test]
fn cri_lines() {
    let (line, partial) = parse_line("2024-05-01T10:00:00.123456789Z stderr F oops: a b c\n");
    assert!(!partial);
    assert_eq!(line.message, "oops: a b c");
    assert_eq!(line.metadata.get("stream").map(String::as_str), Some("stderr"));
    assert_eq!(
        line.timestamp.unwrap().to_rfc3339(),
        "2024-05-01T10:00:00.123456789+00:00"
    );

    let (line, partial) = parse_line("2024-05-01T10:00:00Z stdout P first half");
    assert!(partial);
    assert_eq!(line.message, "first half");

    let (line, _) = parse_line("2024-05-01T10:00:00Z stdout F");
    assert_eq!(line.message, "");
}

#[test]
fn docker_json_lines() {
    let (line, partial) =
        parse_line(r#"{"log":"hello\n","stream":"stdout","time":"2024-05-01T10:00:00Z"}"#);
    assert!(!partial);
    assert_eq!(line.message, "hello");
    assert_eq!(line.metadata.get("stream").map(String::as_str), Some("stdout"));
    assert!(line.timestamp.is_some());
}

#[test]
fn unknown_lines_pass_through() {
    for raw in ["plain text", "{not json", "2024 stdout F nope", "yesterday stdout F msg"] {
        let (line, partial) = parse_line(raw);
        assert!(!partial);
        assert_eq!(line.message, raw);
        assert!(line.timestamp.is_none());
    }
}

#[tokio::test]
async fn reads_whole_file_and_joins_partials() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    write_file(
        &path,
        "2024-05-01T10:00:00Z stdout F one\n\
         2024-05-01T10:00:01Z stdout P tw\n\
         2024-05-01T10:00:01Z stdout F o\n\
         three without newline",
    );

    let (source, mut rx) = start(&path, FileTail::new(&path, TailFrom::Beginning)).await;
    assert_eq!(drain(&mut rx).await, vec!["one", "two", "three without newline"]);
    assert_eq!(source.state(), SourceState::Exhausted);
}

#[tokio::test]
async fn invalid_utf8_does_not_end_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    std::fs::write(&path, b"first\nbad \xff byte\nthird\n").unwrap();

    let (source, mut rx) = start(&path, FileTail::new(&path, TailFrom::Beginning)).await;
    assert_eq!(
        drain(&mut rx).await,
        vec!["first", "bad \u{fffd} byte", "third"]
    );
    assert_eq!(source.state(), SourceState::Exhausted);

    let (_source, mut rx) = start(&path, FileTail::new(&path, TailFrom::Last(2))).await;
    assert_eq!(drain(&mut rx).await, vec!["bad \u{fffd} byte", "third"]);
}

#[tokio::test]
async fn last_n_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    write_file(&path, "a\nb\nc\nd\n");

    let (_source, mut rx) = start(&path, FileTail::new(&path, TailFrom::Last(2))).await;
    assert_eq!(drain(&mut rx).await, vec!["c", "d"]);

    let (_source, mut rx) = start(&path, FileTail::new(&path, TailFrom::Last(0))).await;
    assert!(drain(&mut rx).await.is_empty());
}

#[tokio::test]
async fn follows_appended_lines_from_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    write_file(&path, "old\n");

    let tail = FileTail::new(&path, TailFrom::End).following(Duration::from_millis(10));
    let (source, mut rx) = start(&path, tail).await;

    append(&path, "new 1\n");
    assert_eq!(next(&mut rx).await, "new 1");
    append(&path, "new ");
    append(&path, "2\n");
    assert_eq!(next(&mut rx).await, "new 2");

    source.close();
    assert!(drain(&mut rx).await.is_empty());
    assert_eq!(source.state(), SourceState::Closed);
}

#[tokio::test]
async fn reopens_after_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    write_file(&path, "before\n");

    let tail = FileTail::new(&path, TailFrom::Beginning).following(Duration::from_millis(10));
    let (source, mut rx) = start(&path, tail).await;
    assert_eq!(next(&mut rx).await, "before");

    std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
    write_file(&path, "after\n");
    assert_eq!(next(&mut rx).await, "after");

    source.close();
}

#[tokio::test]
async fn restarts_after_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    write_file(&path, "a long first line\n");

    let tail = FileTail::new(&path, TailFrom::Beginning).following(Duration::from_millis(10));
    let (source, mut rx) = start(&path, tail).await;
    assert_eq!(next(&mut rx).await, "a long first line");

    write_file(&path, "short\n");
    assert_eq!(next(&mut rx).await, "short");

    source.close();
}

#[tokio::test]
async fn removed_file_fails_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    write_file(&path, "x\n");

    let tail = FileTail::new(&path, TailFrom::Beginning).following(Duration::from_millis(10));
    let (source, mut rx) = start(&path, tail).await;
    assert_eq!(next(&mut rx).await, "x");

    std::fs::remove_file(&path).unwrap();
    assert!(drain(&mut rx).await.is_empty());
    assert_eq!(source.state(), SourceState::Failed);
    assert!(source.err().unwrap().to_string().contains("log file removed"));
}

#[tokio::test]
async fn missing_file_fails_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.log");
    let id = SourceId::new("node-a", "default", "web-1", "app", "nope.log");
    let mut source = StreamSource::new(id, FileTail::new(&path, TailFrom::Beginning));

    tokio_test::assert_err!(source.start(&CancellationToken::new()).await);
    assert_eq!(source.state(), SourceState::Failed);
}

#[tokio::test]
async fn scan_filters_by_namespace() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join(log_name("web-1", "shop", "app")), "12345");
    write_file(&dir.path().join(log_name("db-0", "data", "postgres")), "");
    write_file(&dir.path().join("README"), "ignored");

    let all = scan(dir.path(), &[]).await.unwrap();
    assert_eq!(all.len(), 2);

    let shop = scan(dir.path(), &["shop".to_string()]).await.unwrap();
    assert_eq!(shop.len(), 1);
    let (file, stat) = &shop[0];
    assert_eq!(file.pod, "web-1");
    assert_eq!(stat.size, 5);
    assert!(stat.last_event.is_some());
}
