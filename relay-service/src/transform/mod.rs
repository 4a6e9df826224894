use energy_client::domain::{Reading, Sample};
use time::macros::datetime;

use crate::pipeline::{Envelope, PipelineError, Transform};

fn check_measurement(name: &str, value: f64) -> Result<(), PipelineError> {
    if !value.is_finite() {
        return Err(PipelineError::Transform(format!("{name} must be a finite number")));
    }
    if value < 0.0 {
        return Err(PipelineError::Transform(format!("{name} must be non-negative")));
    }
    Ok(())
}

/// Pure validation of a device sample, before registration checks.
///
/// Rules:
/// - device_id must be present.
/// - current, power and energy_wh must be finite and non-negative.
pub fn validate_sample(sample: &Sample) -> Result<(), PipelineError> {
    if sample.device_id.trim().is_empty() {
        return Err(PipelineError::Transform("device_id is required".to_string()));
    }

    check_measurement("current", sample.current)?;
    check_measurement("power", sample.power)?;
    check_measurement("energy_wh", sample.energy_wh)?;
    Ok(())
}

/// Pure validation of an enriched reading arriving from the bus.
///
/// Rules:
/// - measurements as for samples, plus a finite non-negative cost.
/// - channel_number must be 1 or greater.
/// - timestamp must be within [2000-01-01, 2100-01-01].
pub fn validate_reading(env: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
    let r = &env.payload;

    if r.device_id.trim().is_empty() {
        return Err(PipelineError::Transform("device_id is required".to_string()));
    }
    if r.channel_number < 1 {
        return Err(PipelineError::Transform(format!(
            "channel_number must be positive, got {}",
            r.channel_number
        )));
    }

    check_measurement("current", r.current)?;
    check_measurement("power", r.power)?;
    check_measurement("energy_wh", r.energy_wh)?;
    check_measurement("cost", r.cost)?;

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if r.timestamp < min_ts || r.timestamp > max_ts {
        return Err(PipelineError::Transform("timestamp out of allowed range".to_string()));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<Reading, Reading> for ReadingValidation {
    async fn apply(&self, input: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_reading_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}
