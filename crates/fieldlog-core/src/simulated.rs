//! Synthetic sensor for bench-testing a station without hardware attached.

use async_trait::async_trait;

use fieldlog_types::{Reading, SensorKind};

use crate::error::SensorResult;
use crate::traits::SensorSource;

/// Produces a slow sine wave and a sample counter.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    id: String,
    samples: u64,
}

impl SimulatedSensor {
    /// Create a simulated sensor.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            samples: 0,
        }
    }
}

#[async_trait]
impl SensorSource for SimulatedSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Simulated
    }

    async fn read(&mut self) -> SensorResult<Reading> {
        let n = self.samples;
        self.samples += 1;
        let value = 10.0 + 5.0 * (n as f64 / 10.0).sin();

        Ok(Reading::new(self.id.clone(), SensorKind::Simulated)
            .with_field("value", value)
            .with_field("sample", n as i64))
    }
}
