use std::collections::BTreeSet;

use cohortnet_engine::{
    observer, CohortEngine, CohortNetResult, EngineConfig, MemoryStore, SubmitOutcome,
    SymptomCategory,
};
use cohortnet_telemetry::{TelemetryConfig, TelemetryHandle};

fn main() -> CohortNetResult<()> {
    let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("walkthrough"));
    let engine = CohortEngine::with_seed(EngineConfig::default(), MemoryStore::new(), telemetry, [42; 32])?;

    let reports: [&[SymptomCategory]; 7] = [
        &[SymptomCategory::Respiratory],
        &[SymptomCategory::Respiratory, SymptomCategory::Systemic],
        &[],
        &[SymptomCategory::Gastrointestinal],
        &[SymptomCategory::Respiratory],
        &[SymptomCategory::Neurological],
        &[SymptomCategory::Dermatological],
    ];
    for report in reports {
        let selected: BTreeSet<_> = report.iter().copied().collect();
        match engine.submit_selection(&selected, Some("u4pruydqqvj"))? {
            SubmitOutcome::Buffered { pending, threshold } => {
                println!("buffered {pending}/{threshold}");
            }
            SubmitOutcome::Sealed(id) => println!("sealed {id}"),
        }
    }

    let snapshots = engine.list_snapshots()?;
    for snapshot in &snapshots {
        let metrics = engine.privacy_metrics(snapshot)?;
        println!(
            "{} size={} eps={} noise_scale={:.3} token={}",
            snapshot.id(),
            snapshot.size(),
            snapshot.epsilon(),
            metrics.noise_scale,
            snapshot.integrity_token(),
        );
        for (category, score) in snapshot.aggregate_scores().iter() {
            println!("  {category:<16} {score:.3}");
        }
    }
    for point in observer::timeline(&snapshots) {
        println!("timeline {} intensity={:.3}", point.sealed_at_ms, point.intensity);
    }
    println!("still pending: {}", engine.buffer().pending_len());
    Ok(())
}
