//! Persistence of decoded readings.
//!
//! The pool hands every live and historical reading to a
//! [`ReadingRepository`] before broadcasting it. A repository error is logged
//! and never stops a download.

use std::sync::Mutex;

use async_trait::async_trait;

use flora_types::{DeviceId, HistoricalSensorReading, LiveSensorReading};

use crate::error::Result;

/// Sink for decoded readings.
#[async_trait]
pub trait ReadingRepository: Send + Sync {
    async fn save_live_reading(&self, reading: &LiveSensorReading) -> Result<()>;

    async fn save_historical_reading(&self, reading: &HistoricalSensorReading) -> Result<()>;
}

/// Discards every reading.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRepository;

#[async_trait]
impl ReadingRepository for NullRepository {
    async fn save_live_reading(&self, _reading: &LiveSensorReading) -> Result<()> {
        Ok(())
    }

    async fn save_historical_reading(&self, _reading: &HistoricalSensorReading) -> Result<()> {
        Ok(())
    }
}

/// Keeps readings in memory.
///
/// Historical readings are keyed by device and index, so re-reading an
/// entry after a resume replaces the earlier copy.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    live: Mutex<Vec<LiveSensorReading>>,
    history: Mutex<Vec<HistoricalSensorReading>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All live readings, oldest first.
    pub fn live_readings(&self) -> Vec<LiveSensorReading> {
        self.live
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Historical readings of `device`, ordered by index.
    pub fn history_for(&self, device: &DeviceId) -> Vec<HistoricalSensorReading> {
        let mut readings: Vec<_> = self
            .history
            .lock()
            .map(|v| {
                v.iter()
                    .filter(|r| &r.device_id == device)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        readings.sort_by_key(|r| r.index);
        readings
    }
}

#[async_trait]
impl ReadingRepository for MemoryRepository {
    async fn save_live_reading(&self, reading: &LiveSensorReading) -> Result<()> {
        if let Ok(mut live) = self.live.lock() {
            live.push(reading.clone());
        }
        Ok(())
    }

    async fn save_historical_reading(&self, reading: &HistoricalSensorReading) -> Result<()> {
        if let Ok(mut history) = self.history.lock() {
            match history
                .iter_mut()
                .find(|r| r.device_id == reading.device_id && r.index == reading.index)
            {
                Some(existing) => *existing = reading.clone(),
                None => history.push(reading.clone()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flora_types::SensorValues;
    use time::OffsetDateTime;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000)
    }

    fn values() -> SensorValues {
        SensorValues {
            temperature: 20.0,
            brightness: 500,
            moisture: 30,
            conductivity: 400,
        }
    }

    fn historical(index: u16, moisture: u8) -> HistoricalSensorReading {
        HistoricalSensorReading {
            device_id: DeviceId::new("dev"),
            index,
            relative_timestamp: u32::from(index) * 3600,
            recorded_at: now(),
            values: SensorValues {
                moisture,
                ..values()
            },
        }
    }

    #[tokio::test]
    async fn test_history_deduplicated_by_index() {
        let repo = MemoryRepository::new();
        repo.save_historical_reading(&historical(1, 30)).await.unwrap();
        repo.save_historical_reading(&historical(0, 30)).await.unwrap();
        repo.save_historical_reading(&historical(1, 44)).await.unwrap();

        let stored = repo.history_for(&DeviceId::new("dev"));
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].index, 0);
        assert_eq!(stored[1].values.moisture, 44);
        assert!(repo.history_for(&DeviceId::new("other")).is_empty());
    }

    #[tokio::test]
    async fn test_live_readings_kept_in_order() {
        let repo = MemoryRepository::new();
        let reading = LiveSensorReading::new(DeviceId::new("dev"), values(), now());
        repo.save_live_reading(&reading).await.unwrap();
        NullRepository.save_live_reading(&reading).await.unwrap();
        assert_eq!(repo.live_readings(), vec![reading]);
    }
}
