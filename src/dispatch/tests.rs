use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rstest::{fixture, rstest};

use super::*;
use crate::destination::{Destination, DestinationGroup};
use crate::filters::{FilterBuilder, LevelFilterBuilder};
use crate::level::Level;
use crate::log_package::{BoundPackage, GroupId, LogPackage};
use crate::reporting::{ErrorSink, WorkerError};
use crate::test_utils::{CollectingSink, FailingSink, PanickingSink, numbered_packages};

type Reports = Arc<Mutex<Vec<String>>>;

fn recording_sink() -> (Reports, Arc<dyn ErrorSink>) {
    let reports: Reports = Arc::default();
    let sink_reports = Arc::clone(&reports);
    let sink: Arc<dyn ErrorSink> = Arc::new(move |err: &WorkerError| {
        sink_reports.lock().push(err.to_string());
    });
    (reports, sink)
}

fn collecting(name: &str, sink: &CollectingSink) -> Arc<Destination> {
    Arc::new(
        Destination::builder(name)
            .with_sink(Arc::new(sink.clone()))
            .build(),
    )
}

fn debug_config() -> DispatchConfig {
    DispatchConfig::default().with_mode(DispatchMode::Debug)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[fixture]
fn sink() -> CollectingSink {
    CollectingSink::new()
}

#[rstest]
fn flush_preserves_order_with_single_package_chunks(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline =
        DispatchPipeline::start(group, debug_config().with_max_chunk_size(1)).expect("start");
    pipeline
        .send_many(numbered_packages(5, GroupId(0)))
        .expect("send");
    pipeline.flush();

    assert_eq!(sink.messages(), vec!["0", "1", "2", "3", "4"]);
    assert_eq!(sink.batch_sizes(), vec![1; 5]);
}

#[rstest]
fn large_backlog_is_split_into_bounded_chunks(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline = DispatchPipeline::start(group, debug_config()).expect("start");
    pipeline
        .send_many(numbered_packages(125_000, GroupId(0)))
        .expect("send");
    pipeline.flush();

    assert_eq!(sink.batch_sizes(), vec![50_000, 50_000, 25_000]);
    let messages = sink.messages();
    assert_eq!(messages.first().map(String::as_str), Some("0"));
    assert_eq!(messages.last().map(String::as_str), Some("124999"));
}

#[rstest]
fn run_mode_delivers_without_explicit_flush(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline = DispatchPipeline::start(group, DispatchConfig::default()).expect("start");
    for package in numbered_packages(10, GroupId(0)) {
        pipeline.send(package).expect("send");
    }

    assert!(wait_until(Duration::from_secs(2), || sink.messages().len() == 10));
    assert_eq!(sink.messages(), (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
    pipeline.wait_idle();
    assert!(!pipeline.is_processing());
}

#[rstest]
fn packages_route_by_binding_group() {
    let first = CollectingSink::new();
    let second = CollectingSink::new();
    let everything = CollectingSink::new();
    let group = Arc::new(DestinationGroup::with_destinations([
        Arc::new(
            Destination::builder("first")
                .with_sink(Arc::new(first.clone()))
                .with_group(GroupId(1))
                .build(),
        ),
        Arc::new(
            Destination::builder("second")
                .with_sink(Arc::new(second.clone()))
                .with_group(GroupId(2))
                .build(),
        ),
        collecting("everything", &everything),
    ]));
    let pipeline = DispatchPipeline::start(group, debug_config()).expect("start");
    let mut packages = numbered_packages(2, GroupId(1));
    packages.extend(numbered_packages(3, GroupId(2)));
    pipeline.send_many(packages).expect("send");
    pipeline.flush();

    assert_eq!(first.messages(), vec!["0", "1"]);
    assert_eq!(second.messages(), vec!["0", "1", "2"]);
    assert_eq!(everything.messages().len(), 5);
}

#[rstest]
fn destination_filters_apply_during_dispatch(sink: CollectingSink) {
    let filter = FilterBuilder::from(LevelFilterBuilder::new().with_min_level(Level::Warn))
        .build()
        .expect("valid filter");
    let group = Arc::new(DestinationGroup::with_destinations([Arc::new(
        Destination::builder("alerts")
            .with_sink(Arc::new(sink.clone()))
            .with_filter(filter)
            .build(),
    )]));
    let pipeline = DispatchPipeline::start(group, debug_config()).expect("start");
    let packages = [Level::Info, Level::Warn, Level::Debug, Level::Critical]
        .into_iter()
        .map(|level| {
            BoundPackage::new(LogPackage::new("svc", level, level.as_str()), GroupId(0))
        });
    pipeline.send_many(packages).expect("send");
    pipeline.flush();

    assert_eq!(sink.messages(), vec!["WARN", "CRITICAL"]);
}

#[rstest]
fn disabled_destination_receives_nothing(sink: CollectingSink) {
    let destination = collecting("muted", &sink);
    destination.set_enabled(false);
    let group = Arc::new(DestinationGroup::with_destinations([destination]));
    let pipeline = DispatchPipeline::start(group, debug_config()).expect("start");
    pipeline
        .send_many(numbered_packages(3, GroupId(0)))
        .expect("send");
    pipeline.flush();

    assert_eq!(pipeline.queued(), 0);
    assert_eq!(sink.batches(), 0);
}

#[rstest]
fn failing_destinations_do_not_block_others(sink: CollectingSink) {
    let failing = Arc::new(FailingSink::new("collector down"));
    let group = Arc::new(DestinationGroup::with_destinations([
        Arc::new(
            Destination::builder("broken")
                .with_sink(Arc::clone(&failing) as _)
                .build(),
        ),
        Arc::new(
            Destination::builder("exploding")
                .with_sink(Arc::new(PanickingSink))
                .build(),
        ),
        collecting("healthy", &sink),
    ]));
    let (reports, errors) = recording_sink();
    let pipeline = DispatchPipeline::builder(group)
        .with_config(debug_config())
        .with_error_sink(errors)
        .build()
        .expect("start");
    pipeline
        .send_many(numbered_packages(4, GroupId(0)))
        .expect("send");
    pipeline.flush();

    assert_eq!(sink.messages().len(), 4);
    assert_eq!(failing.attempts(), 1);
    let reports = reports.lock();
    assert!(reports.iter().any(|r| r.contains("destination 'broken' failed")));
    assert!(reports.iter().any(|r| r.contains("sink for exploding exploded")));
}

#[rstest]
fn repeated_failures_are_reported_once_per_window() {
    let failing = Arc::new(FailingSink::new("collector down"));
    let group = Arc::new(DestinationGroup::with_destinations([Arc::new(
        Destination::builder("broken")
            .with_sink(Arc::clone(&failing) as _)
            .build(),
    )]));
    let (reports, errors) = recording_sink();
    let pipeline = DispatchPipeline::builder(group)
        .with_config(debug_config())
        .with_error_sink(errors)
        .build()
        .expect("start");
    for package in numbered_packages(3, GroupId(0)) {
        pipeline.send(package).expect("send");
        pipeline.flush();
    }

    assert_eq!(failing.attempts(), 3);
    assert_eq!(reports.lock().len(), 1);
}

#[rstest]
fn backlog_waits_for_an_active_group(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::new());
    let pipeline =
        DispatchPipeline::start(Arc::clone(&group) as _, debug_config()).expect("start");
    pipeline
        .send_many(numbered_packages(3, GroupId(0)))
        .expect("send");
    assert_eq!(pipeline.flush().packages, 0);
    assert_eq!(pipeline.queued(), 3);

    group.activate([collecting("late", &sink)]);
    assert_eq!(pipeline.flush().packages, 3);
    assert_eq!(sink.messages(), vec!["0", "1", "2"]);
}

#[rstest]
fn throttled_producer_returns_after_backlog_drains(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline =
        DispatchPipeline::start(group, DispatchConfig::default().with_throttle_ceiling(3))
            .expect("start");
    pipeline
        .send_many(numbered_packages(10, GroupId(0)))
        .expect("send");

    assert_eq!(sink.messages().len(), 10);
    assert_eq!(pipeline.queued(), 0);
}

#[rstest]
fn debug_mode_drains_on_the_producer_past_the_backlog_threshold(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline = DispatchPipeline::start(group, debug_config()).expect("start");
    pipeline
        .send_many(numbered_packages(DEBUG_BACKLOG_THRESHOLD + 1, GroupId(0)))
        .expect("send");

    assert_eq!(pipeline.queued(), 0);
    assert_eq!(sink.messages().len(), DEBUG_BACKLOG_THRESHOLD + 1);
}

#[rstest]
fn debug_mode_drains_once_the_flush_interval_passes(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline = DispatchPipeline::start(group, debug_config()).expect("start");
    thread::sleep(DEBUG_FLUSH_INTERVAL + Duration::from_millis(20));
    pipeline
        .send_many(numbered_packages(2, GroupId(0)))
        .expect("send");

    assert_eq!(pipeline.queued(), 0);
    assert_eq!(sink.messages(), vec!["0", "1"]);
}

#[rstest]
fn reload_changes_chunking(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline = DispatchPipeline::start(group, debug_config()).expect("start");
    pipeline
        .reload(&debug_config().with_max_chunk_size(2))
        .expect("reload");
    assert_eq!(pipeline.settings().max_chunk_size(), 2);
    pipeline
        .send_many(numbered_packages(5, GroupId(0)))
        .expect("send");
    pipeline.flush();

    assert_eq!(sink.batch_sizes(), vec![2, 2, 1]);
}

#[rstest]
fn reload_rejects_invalid_limits() {
    let pipeline =
        DispatchPipeline::start(Arc::new(DestinationGroup::new()), debug_config()).expect("start");
    let err = pipeline
        .reload(&debug_config().with_throttle_ceiling(0))
        .expect_err("zero ceiling");
    assert!(matches!(err, DispatchError::InvalidConfig(_)));
}

#[rstest]
fn normalizer_runs_before_routing(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline = DispatchPipeline::builder(group)
        .with_config(debug_config())
        .with_normalizer(|bound: BoundPackage| {
            let original = bound.package();
            let package = LogPackage::with_metadata(
                &original.logger,
                original.level,
                &original.message.to_uppercase(),
                original.metadata.clone(),
            );
            BoundPackage::new(package, bound.group())
        })
        .build()
        .expect("start");
    pipeline
        .send(BoundPackage::new(
            LogPackage::new("test", Level::Info, "quiet"),
            GroupId(0),
        ))
        .expect("send");
    pipeline.flush();

    assert_eq!(sink.messages(), vec!["QUIET"]);
}

#[rstest]
fn shutdown_flushes_remainder_and_rejects_new_packages(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline = DispatchPipeline::start(group, debug_config()).expect("start");
    pipeline
        .send_many(numbered_packages(3, GroupId(0)))
        .expect("send");

    pipeline.shutdown();
    assert_eq!(sink.messages().len(), 3);
    assert!(pipeline.is_shut_down());
    assert!(matches!(
        pipeline.send(numbered_packages(1, GroupId(0)).remove(0)),
        Err(DispatchError::ShutDown)
    ));
    assert_eq!(pipeline.shutdown(), DispatchStats::default());
}

#[rstest]
fn dropping_a_run_mode_pipeline_delivers_everything(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    {
        let pipeline = DispatchPipeline::start(group, DispatchConfig::default()).expect("start");
        pipeline
            .send_many(numbered_packages(1_000, GroupId(0)))
            .expect("send");
    }
    assert_eq!(sink.messages().len(), 1_000);
}

#[rstest]
fn concurrent_producers_keep_per_thread_order(sink: CollectingSink) {
    let group = Arc::new(DestinationGroup::with_destinations([collecting("a", &sink)]));
    let pipeline = Arc::new(
        DispatchPipeline::start(group, DispatchConfig::default().with_throttle_ceiling(50))
            .expect("start"),
    );
    let producers: Vec<_> = (0..4)
        .map(|t| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                for package in numbered_packages(200, GroupId(t)) {
                    pipeline.send(package).expect("send");
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer panicked");
    }
    pipeline.shutdown();

    let packages = sink.packages();
    assert_eq!(packages.len(), 800);
    for t in 0..4 {
        let seen: Vec<usize> = packages
            .iter()
            .filter(|p| p.group() == GroupId(t))
            .map(|p| p.package().message.parse().expect("numeric message"))
            .collect();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }
}
