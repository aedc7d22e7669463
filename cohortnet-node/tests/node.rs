use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use cohortnet_engine::{JsonFileStore, NoiseKind, PendingStore, SubmitOutcome, SNAPSHOTS_FILE};
use cohortnet_node::{
    config::{load_config, parse_config, Config, ConfigError, ConfigFormat, LogFormat},
    service::{NodeService, ServiceError},
};
use cohortnet_telemetry::{TelemetryConfig, TelemetryHandle};
use pretty_assertions::assert_eq;

fn configs_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("configs")
}

fn scratch_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("cohortnet-node-{label}-{}-{nanos}", std::process::id()))
}

fn node_config(data_dir: &Path) -> Config {
    let mut config = Config::sample();
    config.node.data_dir = data_dir.to_path_buf();
    config.node.seed = Some("2a".repeat(32));
    config
}

fn telemetry() -> TelemetryHandle {
    TelemetryHandle::from_config(TelemetryConfig::sample("node-test"))
}

#[test]
fn loads_shipped_toml_config() {
    let config = load_config(&configs_dir().join("cohortnet-node.toml"), ConfigFormat::Auto).unwrap();
    assert_eq!(config.engine.cohort.cohort_threshold, 5);
    assert_eq!(config.engine.cohort.epsilon, 0.8);
    assert_eq!(config.engine.noise.mechanism, NoiseKind::Laplace);
    assert_eq!(config.node.log_format, LogFormat::Pretty);
    assert_eq!(config.telemetry.labels["deployment"], "demo");
}

#[test]
fn loads_shipped_yaml_config() {
    let config = load_config(&configs_dir().join("cohortnet-node.yaml"), ConfigFormat::Auto).unwrap();
    assert_eq!(config.engine.cohort.cohort_threshold, 10);
    assert!(!config.engine.cohort.allow_empty_contributions);
    assert_eq!(
        config.engine.noise.mechanism,
        NoiseKind::Gaussian { delta: 0.00001 }
    );
    assert_eq!(config.node.log_format, LogFormat::Json);
    assert_eq!(config.node.seed_bytes().unwrap(), Some([1; 32]));
}

#[test]
fn rejects_invalid_configs() {
    let zero_threshold = "[engine.cohort]\ncohort-threshold = 0\n";
    let config = parse_config(zero_threshold, ConfigFormat::Toml).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

    assert!(matches!(
        parse_config("engine: [not, a, map]", ConfigFormat::Yaml),
        Err(ConfigError::Parse {
            format: ConfigFormat::Yaml,
            ..
        })
    ));
    assert!(matches!(
        load_config(Path::new("/nonexistent/cohortnet.toml"), ConfigFormat::Auto),
        Err(ConfigError::Io { .. })
    ));
}

#[test]
fn empty_document_uses_defaults() {
    let config = parse_config("", ConfigFormat::Toml).unwrap();
    assert_eq!(config, Config::sample());
}

#[test]
fn node_round_trip_across_restarts() {
    let dir = scratch_dir("restart");
    let config = node_config(&dir);

    let service = NodeService::open(&config, telemetry()).unwrap();
    for _ in 0..3 {
        let outcome = service
            .submit(&["respiratory".into(), "Systemic".into()], Some("u4pruydqqvj"))
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Buffered { threshold: 5, .. }));
    }
    let shutdown = service.shutdown().unwrap();
    assert_eq!(shutdown.checkpointed, 3);
    assert_eq!(shutdown.unstored, 0);

    let service = NodeService::open(&config, telemetry()).unwrap();
    assert_eq!(service.engine().buffer().pending_len(), 3);
    service.submit(&[], None).unwrap();
    let outcome = service.submit(&["neurological".into()], None).unwrap();
    assert!(matches!(outcome, SubmitOutcome::Sealed(_)));

    let view = service.observe().unwrap();
    assert_eq!(view.cohorts, 1);
    assert_eq!(view.pending, 0);
    assert_eq!(view.timeline.len(), 1);
    let latest = view.latest.unwrap();
    assert_eq!(latest.size, 5);
    assert_eq!(latest.metrics.anonymity_set, 5);
    assert!(latest.integrity_token.starts_with("blake3:"));

    assert!(service.verify().unwrap().is_clean());
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn unknown_symptom_is_rejected() {
    let dir = scratch_dir("unknown");
    let service = NodeService::open(&node_config(&dir), telemetry()).unwrap();
    assert!(matches!(
        service.submit(&["headache".into()], None),
        Err(ServiceError::Engine(_))
    ));
    assert_eq!(service.engine().buffer().pending_len(), 0);
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn simulate_then_verify_detects_tampering() {
    let dir = scratch_dir("tamper");
    let service = NodeService::open(&node_config(&dir), telemetry()).unwrap();
    let report = service.simulate(12, Some(7)).unwrap();
    assert_eq!(report.submitted, 12);
    assert_eq!(report.sealed.len(), 2);
    assert_eq!(report.pending, 2);
    assert_eq!(service.verify().unwrap().verified, 2);

    let path = dir.join(SNAPSHOTS_FILE);
    let contents = fs::read_to_string(&path).unwrap();
    fs::write(&path, contents.replacen("\"size\": 5", "\"size\": 7", 1)).unwrap();

    let integrity = service.verify().unwrap();
    assert_eq!(integrity.verified, 1);
    assert_eq!(integrity.failures.len(), 1);
    assert!(service.observe().is_err());
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn failed_command_after_recovery_seal_does_not_seal_twice() {
    let dir = scratch_dir("reseal");
    let mut config = node_config(&dir);
    let service = NodeService::open(&config, telemetry()).unwrap();
    for _ in 0..3 {
        service.submit(&["respiratory".into()], None).unwrap();
    }
    service.shutdown().unwrap();

    config.engine.cohort.cohort_threshold = 2;
    let service = NodeService::open(&config, telemetry()).unwrap();
    assert_eq!(service.engine().list_snapshots().unwrap().len(), 1);
    assert!(service.submit(&["cardiac".into()], None).is_err());
    drop(service);

    let service = NodeService::open(&config, telemetry()).unwrap();
    assert_eq!(service.engine().buffer().pending_len(), 0);
    let snapshots = service.engine().list_snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].size(), 3);

    // Admissions reach disk without a shutdown as well.
    service.submit(&["systemic".into()], None).unwrap();
    drop(service);
    let service = NodeService::open(&config, telemetry()).unwrap();
    assert_eq!(service.engine().buffer().pending_len(), 1);
    assert_eq!(service.engine().list_snapshots().unwrap().len(), 1);
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn simulate_honours_shipped_yaml_policy() {
    let dir = scratch_dir("yaml-policy");
    let mut config = load_config(&configs_dir().join("cohortnet-node.yaml"), ConfigFormat::Auto).unwrap();
    config.node.data_dir = dir.clone();

    let service = NodeService::open(&config, telemetry()).unwrap();
    let report = service.simulate(25, Some(7)).unwrap();
    assert_eq!(report.submitted, 25);
    assert_eq!(report.sealed.len(), 2);
    assert_eq!(report.pending, 5);
    assert_eq!(service.engine().telemetry().flush().counter("cohort.rejected"), 0);
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn unstored_snapshot_survives_shutdown_and_is_stored_on_next_open() {
    let dir = scratch_dir("unwritable");
    let config = node_config(&dir);
    let service = NodeService::open(&config, telemetry()).unwrap();

    // A directory where the snapshot temp file goes makes every append fail.
    let blocker = dir.join(format!("{SNAPSHOTS_FILE}.tmp"));
    fs::create_dir(&blocker).unwrap();
    let mut sealed = None;
    for _ in 0..5 {
        if let SubmitOutcome::Sealed(id) = service.submit(&["gastrointestinal".into()], None).unwrap() {
            sealed = Some(id);
        }
    }
    let sealed = sealed.unwrap();
    assert_eq!(service.engine().pending_writes(), 1);

    let shutdown = service.shutdown().unwrap();
    assert_eq!(shutdown.checkpointed, 0);
    assert_eq!(shutdown.unstored, 1);
    let record = JsonFileStore::open(&dir).unwrap().load_pending().unwrap();
    assert!(record.vectors.is_empty());
    assert_eq!(record.unstored.len(), 1);
    assert_eq!(record.unstored[0].contributors.len(), 5);
    assert_eq!(record.contributors(), 5);

    fs::remove_dir(&blocker).unwrap();
    let service = NodeService::open(&config, telemetry()).unwrap();
    assert_eq!(service.engine().pending_writes(), 0);
    assert_eq!(service.engine().buffer().pending_len(), 0);
    let snapshots = service.engine().list_snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id(), &sealed);
    assert_eq!(snapshots[0].size(), 5);
    assert_eq!(service.engine().telemetry().flush().counter("cohort.sealed"), 0);
    fs::remove_dir_all(dir).unwrap();
}
