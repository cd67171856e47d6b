use super::*;
use tokio::time::sleep;

type Calls = Arc<Mutex<Vec<(&'static str, u32, Duration)>>>;

fn recording(window: Duration) -> (Debouncer<&'static str, (&'static str, u32)>, Calls, CancellationToken) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let start = Instant::now();
    let sink = calls.clone();
    let debouncer = Debouncer::new(cancel.clone(), window, move |(key, value)| {
        sink.lock().push((key, value, start.elapsed()));
    });
    (debouncer, calls, cancel)
}

fn values(calls: &Calls, key: &str) -> Vec<u32> {
    calls
        .lock()
        .iter()
        .filter(|(k, _, _)| *k == key)
        .map(|(_, v, _)| *v)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn leading_edge_fires_immediately_once() {
    let (debouncer, calls, _cancel) = recording(Duration::from_millis(10));

    debouncer.debounce("pod-1", ("pod-1", 1));
    tokio::task::yield_now().await;
    assert_eq!(values(&calls, "pod-1"), vec![1]);
    assert_eq!(calls.lock()[0].2, Duration::ZERO);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(values(&calls, "pod-1"), vec![1]);
    assert_eq!(debouncer.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn burst_collapses_to_first_and_last() {
    let (debouncer, calls, _cancel) = recording(Duration::from_millis(10));

    for value in [1, 2, 3] {
        debouncer.debounce("pod-1", ("pod-1", value));
    }
    sleep(Duration::from_millis(50)).await;

    assert_eq!(values(&calls, "pod-1"), vec![1, 3]);
}

#[tokio::test(start_paused = true)]
async fn call_after_window_is_a_fresh_leading_edge() {
    let (debouncer, calls, _cancel) = recording(Duration::from_millis(10));

    debouncer.debounce("pod-1", ("pod-1", 1));
    sleep(Duration::from_millis(20)).await;
    assert_eq!(debouncer.pending(), 0);

    debouncer.debounce("pod-1", ("pod-1", 2));
    tokio::task::yield_now().await;
    assert_eq!(values(&calls, "pod-1"), vec![1, 2]);

    let last = calls.lock().last().map(|(_, _, at)| *at);
    assert_eq!(last, Some(Duration::from_millis(20)));
}

#[tokio::test(start_paused = true)]
async fn keys_debounce_independently() {
    let (debouncer, calls, _cancel) = recording(Duration::from_millis(10));

    debouncer.debounce("pod-1", ("pod-1", 11));
    debouncer.debounce("pod-2", ("pod-2", 21));
    sleep(Duration::from_millis(1)).await;
    debouncer.debounce("pod-1", ("pod-1", 12));
    debouncer.debounce("pod-2", ("pod-2", 22));
    sleep(Duration::from_millis(1)).await;
    debouncer.debounce("pod-1", ("pod-1", 13));
    debouncer.debounce("pod-2", ("pod-2", 23));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(values(&calls, "pod-1"), vec![11, 13]);
    assert_eq!(values(&calls, "pod-2"), vec![21, 23]);

    let calls = calls.lock();
    for (key, value, at) in calls.iter() {
        match value % 10 {
            1 => assert_eq!(*at, Duration::ZERO, "{key} leading edge"),
            3 => assert!(
                *at >= Duration::from_millis(12) && *at < Duration::from_millis(14),
                "{key} trailing edge at {at:?}"
            ),
            _ => panic!("unexpected payload {value} for {key}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn burst_on_one_key_does_not_delay_another() {
    let (debouncer, calls, _cancel) = recording(Duration::from_millis(10));

    debouncer.debounce("noisy", ("noisy", 1));
    for i in 0..5 {
        sleep(Duration::from_millis(5)).await;
        debouncer.debounce("noisy", ("noisy", 2 + i));
        if i == 2 {
            debouncer.debounce("quiet", ("quiet", 100));
        }
    }
    tokio::task::yield_now().await;

    // The noisy key is still inside its window, the quiet one already fired.
    assert_eq!(values(&calls, "noisy"), vec![1]);
    assert_eq!(values(&calls, "quiet"), vec![100]);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(values(&calls, "noisy"), vec![1, 6]);
    assert_eq!(values(&calls, "quiet"), vec![100]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_pending_trailing_edges() {
    let (debouncer, calls, cancel) = recording(Duration::from_millis(10));

    debouncer.debounce("pod-1", ("pod-1", 1));
    debouncer.debounce("pod-1", ("pod-1", 2));
    tokio::task::yield_now().await;
    cancel.cancel();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(values(&calls, "pod-1"), vec![1]);
    assert_eq!(debouncer.pending(), 0);

    debouncer.debounce("pod-1", ("pod-1", 3));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(values(&calls, "pod-1"), vec![1]);
}
