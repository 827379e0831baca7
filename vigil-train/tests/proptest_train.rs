//! Property-based tests for device resolution, class weighting, the metric
//! monitor and checkpoint records.

use proptest::prelude::*;
use std::collections::BTreeMap;

use vigil_train::checkpoint::{CheckpointRecord, CheckpointStore};
use vigil_train::weights::{ClassWeightResolver, Distribution, WeightPolicy};
use vigil_train::{
    DeviceAssignment, DeviceDispatcher, EpochOutputs, MetricGoal, MetricMonitor, MonitorSource,
    OutputHistory, StateDict, TaskDescriptor,
};

fn token(max_index: usize) -> impl Strategy<Value = String> {
    prop_oneof![
        Just("cpu".to_string()),
        Just("cuda".to_string()),
        Just("cuda:all".to_string()),
        (0..max_index).prop_map(|i| format!("cuda:{i}")),
        "[a-z]{1,5}(:[0-9])?",
    ]
}

fn spec() -> impl Strategy<Value = String> {
    prop::collection::vec(token(6), 1..4).prop_map(|tokens| tokens.join(","))
}

// --- Device resolution ---

proptest! {
    #[test]
    fn device_resolution_is_deterministic(spec in spec(), available in 0usize..5) {
        let dispatcher = DeviceDispatcher::with_accelerators(available);
        let first = dispatcher.resolve("train_device", &spec).map_err(|e| e.to_string());
        let second = dispatcher.resolve("train_device", &spec).map_err(|e| e.to_string());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn cpu_never_combines(other in token(4), cpu_first in any::<bool>(), available in 0usize..5) {
        let spec = if cpu_first { format!("cpu,{other}") } else { format!("{other},cpu") };
        let result = DeviceDispatcher::with_accelerators(available).resolve("f", &spec);
        prop_assert!(result.is_err());
    }

    #[test]
    fn cuda_all_never_combines(other in token(4), available in 2usize..5) {
        let result = DeviceDispatcher::with_accelerators(available)
            .resolve("f", &format!("cuda:all,{other}"));
        prop_assert!(result.is_err());
    }

    #[test]
    fn in_range_indices_resolve(
        indices in prop::collection::btree_set(0usize..8, 1..4),
        extra in 1usize..4,
    ) {
        let available = indices.iter().max().copied().unwrap_or(0) + extra;
        let spec: Vec<String> = indices.iter().map(|i| format!("cuda:{i}")).collect();
        let resolved = DeviceDispatcher::with_accelerators(available)
            .resolve("f", &spec.join(","))
            .unwrap();
        let expected: Vec<usize> = indices.iter().copied().collect();
        match resolved {
            DeviceAssignment::Single(idx) => prop_assert_eq!(vec![idx], expected),
            DeviceAssignment::Multi(idxs) => prop_assert_eq!(idxs, expected),
            other => prop_assert!(false, "unexpected assignment {}", other),
        }
    }

    #[test]
    fn out_of_range_is_resource_error(index in 0usize..16, available in 1usize..8) {
        prop_assume!(index >= available);
        let err = DeviceDispatcher::with_accelerators(available)
            .resolve("f", &format!("cuda:{index}"))
            .unwrap_err();
        prop_assert!(err.is_resource());
    }
}

// --- Class weights ---

fn class_counts() -> impl Strategy<Value = BTreeMap<String, u64>> {
    prop::collection::vec(1u64..10_000, 1..8).prop_map(|sizes| {
        sizes
            .into_iter()
            .enumerate()
            .map(|(i, n)| (format!("class{i}"), n))
            .collect()
    })
}

fn distribution() -> impl Strategy<Value = Distribution> {
    prop_oneof![Just(Distribution::Uniform), (1u32..5).prop_map(Distribution::Root)]
}

proptest! {
    #[test]
    fn normalized_weights_have_unit_mean(
        counts in class_counts(),
        distribution in distribution(),
        max_weight in prop_oneof![Just(f64::INFINITY), 1.0f64..50.0],
    ) {
        let policy = WeightPolicy { distribution, max_weight, normalize: true };
        let weights = ClassWeightResolver::new(policy).resolve(&counts, &[]).unwrap();
        let dense = weights.dense();
        prop_assert!(dense.iter().all(|w| *w >= 0.0));
        let mean = dense.iter().sum::<f64>() / dense.len() as f64;
        prop_assert!((mean - 1.0).abs() < 1e-6);
    }

    #[test]
    fn unnormalized_weights_respect_max(
        counts in class_counts(),
        distribution in distribution(),
        max_weight in 1.0f64..50.0,
    ) {
        let policy = WeightPolicy { distribution, max_weight, normalize: false };
        let weights = ClassWeightResolver::new(policy).resolve(&counts, &[]).unwrap();
        for (_, w) in weights.iter() {
            prop_assert!(w >= 1.0 - 1e-12);
            prop_assert!(w <= max_weight);
        }
    }

    #[test]
    fn dense_and_named_agree(counts in class_counts(), distribution in distribution()) {
        let policy = WeightPolicy { distribution, ..WeightPolicy::default() };
        let weights = ClassWeightResolver::new(policy).resolve(&counts, &[]).unwrap();
        let named = weights.named();
        let names: Vec<&String> = counts.keys().collect();
        for (i, w) in weights.dense().into_iter().enumerate() {
            prop_assert_eq!(named[names[i]], w);
        }
    }
}

// --- Monitor laws ---

fn goal() -> impl Strategy<Value = MetricGoal> {
    prop_oneof![Just(MetricGoal::Minimize), Just(MetricGoal::Maximize)]
}

proptest! {
    #[test]
    fn first_value_is_always_best(goal in goal(), value in -1e6f64..1e6) {
        let mut monitor = MetricMonitor::with_goal("m", goal, MonitorSource::Valid);
        prop_assert!(monitor.observe(value));
        prop_assert_eq!(monitor.best(), Some(value));
    }

    #[test]
    fn only_strict_improvements_count(
        goal in goal(),
        first in -1e6f64..1e6,
        second in -1e6f64..1e6,
    ) {
        let mut monitor = MetricMonitor::with_goal("m", goal, MonitorSource::Train);
        monitor.observe(first);
        let improved = monitor.observe(second);
        let expected = match goal {
            MetricGoal::Minimize => second < first,
            MetricGoal::Maximize => second > first,
        };
        prop_assert_eq!(improved, expected);
        prop_assert!(!monitor.observe(monitor.best().unwrap()));
    }

    #[test]
    fn best_is_extremum_of_history(goal in goal(), values in prop::collection::vec(-1e3f64..1e3, 1..20)) {
        let mut monitor = MetricMonitor::with_goal("m", goal, MonitorSource::Train);
        for v in &values {
            monitor.observe(*v);
        }
        let expected = match goal {
            MetricGoal::Minimize => values.iter().copied().fold(f64::INFINITY, f64::min),
            MetricGoal::Maximize => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        prop_assert_eq!(monitor.best(), Some(expected));
    }
}

// --- Checkpoint records ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn checkpoint_save_load_preserves_state(
        epoch in 1usize..500,
        iter in 0u64..1_000_000,
        best in prop::option::of(any::<f64>().prop_filter("finite", |v| v.is_finite())),
        weights in prop::collection::vec(any::<f64>().prop_filter("finite", |v| v.is_finite()), 0..16),
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut history = OutputHistory::new();
        history.append(epoch, EpochOutputs::default()).unwrap();
        let record = CheckpointRecord {
            name: "prop".into(),
            epoch,
            iter,
            time: "20240101-000000".into(),
            host: "host".into(),
            task: TaskDescriptor::Generic { name: "regression".into() },
            outputs: EpochOutputs::default(),
            history,
            model_state: StateDict::from([("w".to_string(), weights)]),
            optimizer_state: Some(serde_json::json!({"lr": 0.1, "step": iter})),
            monitor_best: best,
            config: None,
        };
        let path = store.save(&record, true).unwrap();
        let loaded = store.load(&path).unwrap();
        prop_assert_eq!(&loaded, &record);
        prop_assert_eq!(store.load_best().unwrap(), record);
    }
}
