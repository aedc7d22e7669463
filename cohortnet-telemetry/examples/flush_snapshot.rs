use cohortnet_telemetry::{TelemetryConfig, TelemetryHandle};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("cohort-engine"));

    for _ in 0..4 {
        telemetry.record_counter("cohort.admitted", 1)?;
    }
    telemetry.record_gauge("cohort.pending", 4);
    telemetry.record_latency_us("cohort.seal_us", 180);

    let snapshot = telemetry.flush();
    println!("[cohortnet-telemetry] {}", snapshot.to_json()?);
    Ok(())
}
