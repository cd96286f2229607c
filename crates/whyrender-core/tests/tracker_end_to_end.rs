//! End-to-end render tracking through the public API.
//!
//! A. Counter: explicit re-renders with and without a state change
//! B. Widget: parameters-set with host-supplied and detected changes
//! C. Collections, ignored fields, frequency, JSON output

mod common;

use std::sync::Arc;

use common::{Counter, Widget};
use whyrender_core::config::TrackerConfig;
use whyrender_core::parameters::ParameterComparer;
use whyrender_core::{
    ChangeKind, CollectingSink, ComparisonError, FieldValue, JsonLinesSink, ParameterChange,
    ParameterChanges, RenderTracker, RenderTrigger, TrackOptions, TrackedComponent,
};

fn tracker_with(config: TrackerConfig) -> (RenderTracker, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let tracker = RenderTracker::builder(config)
        .sink(sink.clone())
        .build()
        .unwrap();
    (tracker, sink)
}

// =============================================================================
// A. Counter
// =============================================================================

#[test]
fn counter_rerender_without_change_is_unnecessary() {
    let (tracker, _sink) = tracker_with(TrackerConfig::default());
    let counter = Counter::new(tracker.registry());

    let first = tracker
        .track(&counter, RenderTrigger::ExplicitRerender, None)
        .unwrap();
    assert!(!first.is_unnecessary, "first observation counts as a change");

    let second = tracker
        .track(&counter, RenderTrigger::ExplicitRerender, None)
        .unwrap();
    assert!(second.is_unnecessary);
    assert!(
        second
            .unnecessary_reason
            .as_deref()
            .unwrap()
            .contains("no state change")
    );
}

#[test]
fn counter_rerender_after_change_is_necessary() {
    let (tracker, _sink) = tracker_with(TrackerConfig::default());
    let counter = Counter::new(tracker.registry());

    tracker.track(&counter, RenderTrigger::ExplicitRerender, None);
    counter.set(1);
    let event = tracker
        .track(&counter, RenderTrigger::ExplicitRerender, None)
        .unwrap();
    assert!(!event.is_unnecessary);
    assert_eq!(event.state_changes.len(), 1);
    let change = &event.state_changes[0];
    assert_eq!(change.field, "count");
    assert_eq!(change.kind, ChangeKind::Modified);
}

#[test]
fn first_render_is_never_unnecessary() {
    let (tracker, sink) = tracker_with(TrackerConfig::default());
    let counter = Counter::new(tracker.registry());
    tracker.track(&counter, RenderTrigger::Initialized, Some(true));
    tracker.track(&counter, RenderTrigger::ExplicitRerender, Some(true));
    assert!(sink.events().iter().all(|e| !e.is_unnecessary));
}

#[test]
fn instances_of_one_type_are_tracked_separately() {
    let (tracker, _sink) = tracker_with(TrackerConfig::default());
    let a = Counter::new(tracker.registry());
    let b = Counter::new(tracker.registry());

    tracker.track(&a, RenderTrigger::ExplicitRerender, None);
    tracker.track(&b, RenderTrigger::ExplicitRerender, None);
    b.set(5);

    let a_again = tracker
        .track(&a, RenderTrigger::ExplicitRerender, None)
        .unwrap();
    let b_again = tracker
        .track(&b, RenderTrigger::ExplicitRerender, None)
        .unwrap();
    assert!(a_again.is_unnecessary);
    assert!(!b_again.is_unnecessary);
    assert_eq!(tracker.metadata_cache().len(), 1, "metadata is per type");
}

// =============================================================================
// B. Widget parameters
// =============================================================================

fn params_set(
    tracker: &RenderTracker,
    widget: &Widget,
    changes: ParameterChanges,
) -> whyrender_core::RenderEvent {
    tracker
        .track_with(
            widget,
            RenderTrigger::ParametersSet,
            TrackOptions::default().parameter_changes(changes),
        )
        .unwrap()
}

#[test]
fn widget_parameters_set_classification() {
    let (tracker, _sink) = tracker_with(TrackerConfig::default());
    let widget = Widget::new(tracker.registry(), "A");

    assert!(params_set(&tracker, &widget, ParameterChanges::new()).is_unnecessary);

    let same = ParameterChanges::new().with("Title", ParameterChange::new("A", "A"));
    let event = params_set(&tracker, &widget, same);
    assert!(event.is_unnecessary);
    assert!(event.unnecessary_reason.unwrap().contains("Title"));

    let different = ParameterChanges::new().with("Title", ParameterChange::new("A", "B"));
    assert!(!params_set(&tracker, &widget, different).is_unnecessary);
}

#[test]
fn custom_comparer_decides_meaningfulness() {
    // Case-only title changes do not matter to this host.
    let comparer = |_name: &str, change: &ParameterChange| {
        let text = |v: &Option<FieldValue>| {
            v.as_ref().map(|v| v.to_string().to_lowercase())
        };
        Ok::<_, ComparisonError>(text(&change.previous) != text(&change.current))
    };
    let comparer: Arc<dyn ParameterComparer> = Arc::new(comparer);
    let tracker = RenderTracker::builder(TrackerConfig::default())
        .comparer(comparer)
        .build()
        .unwrap();
    let widget = Widget::new(tracker.registry(), "a");

    let case_only = ParameterChanges::new().with("Title", ParameterChange::new("a", "A"));
    assert!(params_set(&tracker, &widget, case_only).is_unnecessary);
    let real = ParameterChanges::new().with("Title", ParameterChange::new("a", "b"));
    assert!(!params_set(&tracker, &widget, real).is_unnecessary);
}

#[test]
fn history_detector_diffs_exposed_parameters() {
    let tracker = RenderTracker::builder(TrackerConfig::default())
        .history_parameter_detector()
        .build()
        .unwrap();
    let widget = Widget::new(tracker.registry(), "A");

    let first = tracker
        .track(&widget, RenderTrigger::ParametersSet, Some(true))
        .unwrap();
    let added = first.parameter_changes.unwrap();
    assert!(added.get("Title").unwrap().previous.is_none());

    let unchanged = tracker
        .track(&widget, RenderTrigger::ParametersSet, None)
        .unwrap();
    assert!(unchanged.is_unnecessary);

    widget.update(|s| s.title = "B".into());
    let changed = tracker
        .track(&widget, RenderTrigger::ParametersSet, None)
        .unwrap();
    assert!(!changed.is_unnecessary);
    assert!(changed.parameter_changes.unwrap().get("Title").is_some());
}

#[test]
fn default_tracker_detects_parameter_changes() {
    let tracker = RenderTracker::new(TrackerConfig::default(), Vec::new()).unwrap();
    let widget = Widget::new(tracker.registry(), "A");
    tracker.track(&widget, RenderTrigger::ParametersSet, Some(true));

    widget.update(|s| s.title = "B".into());
    let changed = tracker
        .track(&widget, RenderTrigger::ParametersSet, None)
        .unwrap();
    assert!(!changed.is_unnecessary, "{:?}", changed.unnecessary_reason);
    let title = changed.parameter_changes.unwrap();
    let title = title.get("Title").unwrap();
    assert!(matches!(&title.previous, Some(FieldValue::Text(t)) if &**t == "A"));
    assert!(matches!(&title.current, Some(FieldValue::Text(t)) if &**t == "B"));

    let repeated = tracker
        .track(&widget, RenderTrigger::ParametersSet, None)
        .unwrap();
    assert!(repeated.is_unnecessary);
}

// =============================================================================
// C. Fields, frequency, output
// =============================================================================

#[test]
fn collection_contents_and_ignored_fields() {
    let (tracker, _sink) = tracker_with(TrackerConfig::default());
    let widget = Widget::new(tracker.registry(), "A");
    tracker.track(&widget, RenderTrigger::ExplicitRerender, None);

    widget.update(|s| s.scratch = "noise".into());
    let ignored = tracker
        .track(&widget, RenderTrigger::ExplicitRerender, None)
        .unwrap();
    assert!(ignored.is_unnecessary, "ignored fields never count");

    widget.update(|s| s.items.push(3));
    let event = tracker
        .track(&widget, RenderTrigger::ExplicitRerender, None)
        .unwrap();
    assert!(!event.is_unnecessary);
    assert_eq!(event.state_changes[0].field, "items");
}

#[test]
fn frequent_renders_are_flagged() {
    let mut config = TrackerConfig::default();
    config.frequency.window_ms = 60_000;
    config.frequency.threshold_per_second = 0.05;
    let (tracker, _sink) = tracker_with(config);
    let counter = Counter::new(tracker.registry());

    let events: Vec<_> = (0..4)
        .map(|i| {
            counter.set(i);
            tracker
                .track(&counter, RenderTrigger::AfterRender, None)
                .unwrap()
        })
        .collect();
    // 3 renders in 60s is exactly 0.05/s; only the fourth exceeds it.
    assert!(!events[2].is_frequent);
    assert!(events[3].is_frequent);
    assert!(events[3].render_rate.unwrap() > 0.05);
    assert!(events[3].is_noteworthy());
}

#[test]
fn disabled_detectors_leave_events_plain() {
    let mut config = TrackerConfig::default();
    config.tracking.unnecessary_render_detection = false;
    config.tracking.frequency_tracking = false;
    config.tracking.performance_tracking = false;
    let (tracker, _sink) = tracker_with(config);
    let counter = Counter::new(tracker.registry());

    tracker.track(&counter, RenderTrigger::ExplicitRerender, Some(true));
    counter.set(2);
    let event = tracker
        .track(&counter, RenderTrigger::ExplicitRerender, None)
        .unwrap();
    assert!(!event.is_unnecessary);
    assert!(!event.is_frequent);
    assert!(event.duration_ms.is_none());
    assert_eq!(event.state_changes.len(), 1, "state tracking still reports changes");
}

#[test]
fn events_serialize_as_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("renders.jsonl");
    let file_sink = Arc::new(JsonLinesSink::append_to(&path).unwrap());
    let tracker = RenderTracker::builder(TrackerConfig::default())
        .sink(file_sink.clone())
        .build()
        .unwrap();
    let counter = Counter::new(tracker.registry());

    tracker.track(&counter, RenderTrigger::ExplicitRerender, None);
    tracker.track(&counter, RenderTrigger::ExplicitRerender, None);
    file_sink.flush().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["component"], "Counter");
    assert_eq!(lines[1]["namespace"], "App.Pages");
    assert_eq!(lines[1]["trigger"], "explicit-rerender");
    assert_eq!(lines[1]["is_unnecessary"], true);
}

#[test]
fn config_file_drives_tracker() {
    let config = TrackerConfig::from_toml_str(
        r#"
        [tracking]
        log_only_unnecessary = true

        [filter]
        exclude_components = ["Widget"]
        "#,
    )
    .unwrap();
    let (tracker, sink) = tracker_with(config);
    let counter = Counter::new(tracker.registry());
    let widget = Widget::new(tracker.registry(), "A");

    assert!(tracker.track(&widget, RenderTrigger::AfterRender, None).is_none());
    tracker.track(&counter, RenderTrigger::ExplicitRerender, None);
    tracker.track(&counter, RenderTrigger::ExplicitRerender, None);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_unnecessary);
    let stats = tracker.statistics().tracker;
    assert_eq!(stats.renders_filtered, 1);
    assert_eq!(stats.events_suppressed, 1);
}

#[test]
fn component_views_expose_tracked_state() {
    let (tracker, _sink) = tracker_with(TrackerConfig::default());
    let widget = Widget::new(tracker.registry(), "A");
    widget.update(|s| s.items = vec![1, 2]);
    tracker.track(&widget, RenderTrigger::ExplicitRerender, None);
    tracker.track(&widget, RenderTrigger::ExplicitRerender, None);

    let store = tracker.snapshots();
    let snapshot = store.get_current(&widget).unwrap();
    let mut names: Vec<&str> = snapshot.fields().map(|(name, _)| name).collect();
    names.sort_unstable();
    assert_eq!(names, ["items", "title"]);
    assert!(snapshot.captured_at() <= chrono::Utc::now());
    assert!(store.stored_at(&widget).is_some());
    assert_eq!(store.access_count(&widget), Some(3), "two stores plus one read");
    assert_eq!(store.settings().max_snapshots, tracker.config().snapshots.max_snapshots);

    let metadata = tracker
        .metadata_cache()
        .peek(widget.component_type())
        .unwrap();
    assert_eq!(metadata.fields().len(), 3);
    assert!(metadata.created_at() <= chrono::Utc::now());
    let cache = tracker.metadata_cache().snapshot_statistics();
    assert!(cache.hit_rate() > 0.0);
    assert_eq!(tracker.metadata_cache().settings().max_entries, 1_000);

    let frequency = tracker.frequency();
    assert!((frequency.rate(&widget) - 2.0 / 5.0).abs() < 1e-9);
    assert!(!frequency.record_and_classify(&widget));
    assert_eq!(frequency.settings().threshold_per_second, 10.0);
}

#[test]
fn performance_summaries_aggregate_per_type() {
    let (tracker, _sink) = tracker_with(TrackerConfig::default());
    let a = Counter::new(tracker.registry());
    let b = Counter::new(tracker.registry());
    for counter in [&a, &b] {
        tracker.start_render(counter, RenderTrigger::AfterRender);
        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.track(counter, RenderTrigger::AfterRender, None);
    }

    let summaries = tracker.performance().summaries();
    assert_eq!(summaries.len(), 1);
    let stats = &summaries[0];
    assert_eq!(stats.component, "Counter");
    assert_eq!(stats.count, 2);
    assert!(stats.min_ms >= 1.0);
    assert!(stats.max_ms >= stats.min_ms);
    assert!((stats.average_ms() - stats.total_ms / 2.0).abs() < 1e-9);
}
