//! Modbus RTU anemometer.
//!
//! The sensor exposes two holding registers:
//!
//! | Register | Content |
//! |----------|---------|
//! | 0 | Wind speed in 0.01 m/s |
//! | 1 | Wind direction in degrees |
//!
//! Values are reported raw; the point builder's wind profile scales speed.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;

use fieldlog_types::{Reading, SensorKind};

use crate::error::{SensorError, SensorResult};
use crate::modbus::ModbusRtu;
use crate::traits::SensorSource;

/// Register holding the wind speed.
pub const SPEED_REGISTER: u16 = 0;

/// Default Modbus unit id of the anemometer.
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Wind speed and direction sensor on a Modbus RTU bus.
#[derive(Debug)]
pub struct WindSensor<T> {
    id: String,
    unit_id: u8,
    bus: ModbusRtu<T>,
}

impl WindSensor<SerialStream> {
    /// Open the sensor on a serial port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<P: AsRef<Path>>(
        id: impl Into<String>,
        device: P,
        unit_id: u8,
        baud_rate: u32,
        timeout: Duration,
    ) -> SensorResult<Self> {
        let bus = ModbusRtu::open(device, baud_rate, timeout)?;
        Ok(Self::new(id, unit_id, bus))
    }
}

impl<T> WindSensor<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Use an already opened bus.
    pub fn new(id: impl Into<String>, unit_id: u8, bus: ModbusRtu<T>) -> Self {
        Self {
            id: id.into(),
            unit_id,
            bus,
        }
    }
}

#[async_trait]
impl<T> SensorSource for WindSensor<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Wind
    }

    async fn read(&mut self) -> SensorResult<Reading> {
        let registers = self
            .bus
            .read_holding_registers(self.unit_id, SPEED_REGISTER, 2)
            .await?;
        let [speed, direction] = registers[..] else {
            return Err(SensorError::invalid_frame(format!(
                "expected 2 registers, got {}",
                registers.len()
            )));
        };

        Ok(Reading::new(self.id.clone(), SensorKind::Wind)
            .with_field("speed", speed)
            .with_field("direction", direction))
    }

    async fn close(&mut self) -> SensorResult<()> {
        self.bus.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::tests::{response_frame, serve_once};
    use fieldlog_types::FieldValue;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_wind() {
        let (master, mut slave) = duplex(64);
        let mut sensor = WindSensor::new(
            "mast-1",
            DEFAULT_UNIT_ID,
            ModbusRtu::new(master, Duration::from_secs(1)),
        );

        tokio::spawn(async move { serve_once(&mut slave, &response_frame(1, &[412, 185])).await });

        let reading = sensor.read().await.unwrap();
        assert_eq!(reading.sensor_id, "mast-1");
        assert_eq!(reading.kind, SensorKind::Wind);
        assert_eq!(reading.field("speed"), Some(FieldValue::Integer(412)));
        assert_eq!(reading.field("direction"), Some(FieldValue::Integer(185)));
        assert!(reading.captured_at.is_none());
    }

    #[tokio::test]
    async fn test_read_after_garbled_response() {
        let (master, mut slave) = duplex(64);
        let mut sensor = WindSensor::new(
            "mast-1",
            DEFAULT_UNIT_ID,
            ModbusRtu::new(master, Duration::from_secs(1)),
        );

        tokio::spawn(async move {
            let mut garbled = response_frame(1, &[100, 90]);
            garbled[2] = 0x06;
            serve_once(&mut slave, &garbled).await;
            serve_once(&mut slave, &response_frame(1, &[412, 185])).await
        });

        assert!(sensor.read().await.is_err());
        let reading = sensor.read().await.unwrap();
        assert_eq!(reading.field("speed"), Some(FieldValue::Integer(412)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_sensor_error() {
        let (master, _slave) = duplex(64);
        let mut sensor = WindSensor::new(
            "mast-1",
            DEFAULT_UNIT_ID,
            ModbusRtu::new(master, Duration::from_millis(200)),
        );
        assert!(matches!(
            sensor.read().await,
            Err(SensorError::Timeout { .. })
        ));
    }
}
