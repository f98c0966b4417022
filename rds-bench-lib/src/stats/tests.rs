use super::*;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn test_record_counts_outcomes() {
    let mut stats = WindowStats::try_new().unwrap();
    stats.record(Action::Get, Outcome::Success, ms(1));
    stats.record(Action::Get, Outcome::ExpectedMiss, ms(2));
    stats.record(Action::Get, Outcome::Failure(FailureKind::Timeout), ms(200));
    stats.record(Action::Create, Outcome::Skipped, Duration::ZERO);

    let get = stats.action(Action::Get);
    assert_eq!(get.attempted, 3);
    assert_eq!(get.succeeded, 1);
    assert_eq!(get.expected_misses, 1);
    assert_eq!(get.failed_total(), 1);
    assert_eq!(get.failed[FailureKind::Timeout as usize], 1);
    assert_eq!(get.latency.len(), 3);

    let create = stats.action(Action::Create);
    assert_eq!(create.attempted, 0);
    assert_eq!(create.skipped, 1);
    assert_eq!(create.latency.len(), 0);
}

#[test]
fn test_merge_is_commutative() {
    let mut a = WindowStats::try_new().unwrap();
    a.record(Action::Insert, Outcome::Success, ms(3));
    a.record_bytes(100, 5);

    let mut b = WindowStats::try_new().unwrap();
    b.record(Action::Insert, Outcome::Failure(FailureKind::Io), ms(7));
    b.record(Action::Len, Outcome::Success, ms(1));
    b.record_bytes(40, 10);

    let mut ab = a.clone();
    ab.merge(&b);
    let mut ba = b.clone();
    ba.merge(&a);

    for stats in [&ab, &ba] {
        assert_eq!(stats.attempted(), 3);
        assert_eq!(stats.bytes_sent, 140);
        assert_eq!(stats.bytes_received, 15);
        assert_eq!(stats.action(Action::Insert).attempted, 2);
        assert_eq!(stats.action(Action::Insert).latency.len(), 2);
    }
    assert_eq!(
        ab.action(Action::Insert).latency.max(),
        ba.action(Action::Insert).latency.max()
    );
}

#[test]
fn test_flush_seals_and_resets_worker_buffers() {
    let mut collector = StatsCollector::try_new().unwrap();
    let first = collector.register();
    let second = collector.register();

    first.record(Action::Get, Outcome::Success, ms(1));
    second.record_request(Action::Get, Outcome::Success, ms(2), 30, 5);
    second.record(Action::Delete, Outcome::Skipped, Duration::ZERO);

    let window = collector.flush();
    assert_eq!(window.action(Action::Get).attempted, 2);
    assert_eq!(window.action(Action::Delete).skipped, 1);
    assert_eq!(window.bytes_sent, 30);

    let next = collector.flush();
    assert_eq!(next.attempted(), 0);
    assert_eq!(next.action(Action::Delete).skipped, 0);
}

#[test]
fn test_window_report_summary() {
    let mut stats = WindowStats::try_new().unwrap();
    for latency in 1..=100 {
        stats.record(Action::Find, Outcome::Success, ms(latency));
    }
    stats.record(Action::Find, Outcome::Failure(FailureKind::Protocol), ms(1));
    stats.record(Action::Create, Outcome::Skipped, Duration::ZERO);

    let report = WindowReport::new(2, ms(20_000), ms(30_000), &stats, vec![Some(7)]);
    assert_eq!(report.window, 2);
    assert_eq!(report.duration(), ms(10_000));
    assert_eq!(report.attempted(), 101);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.skipped(), 1);
    assert!((report.throughput() - 10.1).abs() < 1e-9);
    assert_eq!(report.existing, vec![Some(7)]);

    // only drawn actions are listed
    assert_eq!(report.actions.len(), 2);
    let create = report.action(Action::Create).unwrap();
    assert!(create.latency.is_none());

    let find = report.action(Action::Find).unwrap();
    assert_eq!(find.failures[2], (FailureKind::Protocol, 1));
    let latency = find.latency.unwrap();
    assert_eq!(latency.min, ms(1));
    assert!(latency.p50 >= ms(49) && latency.p50 <= ms(51));
    assert!(latency.max >= ms(100) && latency.max <= ms(101));
    assert!(latency.p90 <= latency.p99);
}
