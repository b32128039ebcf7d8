use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::platform::{DataSink, Reading};
use crate::sensor::SensorSource;

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(1000);

/// How often a stream publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Every(Duration),
    /// Publish once when (re)configured, then stay idle.
    Stopped,
}

impl Period {
    /// Resolves a configured frequency in milliseconds; 0 means unset.
    pub fn from_millis(frequency: u64) -> Period {
        if frequency == 0 {
            Period::Every(DEFAULT_PERIOD)
        } else {
            Period::Every(Duration::from_millis(frequency))
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Every(d) => write!(f, "{}ms", d.as_millis()),
            Period::Stopped => f.write_str("stopped"),
        }
    }
}

/// The quantity a stream samples from the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Temperature,
    Pressure,
}

impl Metric {
    pub fn sample(self, sensor: &dyn SensorSource) -> f32 {
        match self {
            Metric::Temperature => sensor.read_temperature(),
            Metric::Pressure => sensor.read_pressure(),
        }
    }
}

struct MetricStream {
    thing_id: String,
    metric: Metric,
    period: Period,
    task: Option<JoinHandle<()>>,
    /// Held for the duration of each publish cycle.
    cycle: Arc<Mutex<()>>,
}

impl MetricStream {
    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One recurring publish task per metric stream.
///
/// Rescheduling always aborts the stream's current task before spawning the
/// next one, and the next one cannot begin a cycle until the aborted one has
/// released the stream's cycle lock, so a stream never has two cycles
/// outstanding. Must be driven from inside a tokio runtime.
pub struct PublishScheduler {
    sensor: Arc<dyn SensorSource>,
    sink: Arc<dyn DataSink>,
    streams: Vec<MetricStream>,
}

impl PublishScheduler {
    pub fn new(sensor: Arc<dyn SensorSource>, sink: Arc<dyn DataSink>) -> Self {
        PublishScheduler {
            sensor,
            sink,
            streams: Vec::new(),
        }
    }

    pub fn add_stream(&mut self, thing_id: impl Into<String>, metric: Metric) {
        self.streams.push(MetricStream {
            thing_id: thing_id.into(),
            metric,
            period: Period::Stopped,
            task: None,
            cycle: Arc::new(Mutex::new(())),
        });
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|s| s.thing_id.as_str())
    }

    pub fn period(&self, thing_id: &str) -> Option<Period> {
        self.stream(thing_id).map(|s| s.period)
    }

    pub fn is_scheduled(&self, thing_id: &str) -> bool {
        self.stream(thing_id)
            .and_then(|s| s.task.as_ref())
            .map_or(false, |task| !task.is_finished())
    }

    fn stream(&self, thing_id: &str) -> Option<&MetricStream> {
        self.streams.iter().find(|s| s.thing_id == thing_id)
    }

    /// Cancels the stream's pending task, publishes immediately and, unless
    /// the period is [`Period::Stopped`], keeps publishing every period.
    pub fn reconfigure(&mut self, thing_id: &str, period: Period) -> bool {
        let sensor = self.sensor.clone();
        let sink = self.sink.clone();
        let Some(stream) = self.streams.iter_mut().find(|s| s.thing_id == thing_id) else {
            warn!(thing = %thing_id, "configuration for unknown stream ignored");
            return false;
        };

        stream.cancel();
        stream.period = period;
        info!(thing = %thing_id, %period, "stream scheduled");
        stream.task = Some(tokio::spawn(publish_loop(
            stream.thing_id.clone(),
            stream.metric,
            period,
            stream.cycle.clone(),
            sensor,
            sink,
        )));
        true
    }

    /// Seeds every stream from `stored` and starts them all.
    pub fn start_all<F>(&mut self, stored: F)
    where
        F: Fn(&str) -> Option<u64>,
    {
        let seeds: Vec<(String, Period)> = self
            .streams
            .iter()
            .map(|s| {
                let frequency = stored(&s.thing_id).unwrap_or(0);
                (s.thing_id.clone(), Period::from_millis(frequency))
            })
            .collect();
        for (thing_id, period) in seeds {
            self.reconfigure(&thing_id, period);
        }
    }

    pub fn stop_all(&mut self) {
        for stream in &mut self.streams {
            if stream.task.is_some() {
                debug!(thing = %stream.thing_id, "stream unscheduled");
            }
            stream.cancel();
        }
    }
}

impl Drop for PublishScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn publish_loop(
    thing_id: String,
    metric: Metric,
    period: Period,
    cycle: Arc<Mutex<()>>,
    sensor: Arc<dyn SensorSource>,
    sink: Arc<dyn DataSink>,
) {
    loop {
        {
            let _cycle = cycle.lock().await;
            publish_cycle(&thing_id, metric, period, sensor.as_ref(), sink.as_ref()).await;
        }
        match period {
            Period::Every(interval) => tokio::time::sleep(interval).await,
            Period::Stopped => break,
        }
    }
}

async fn publish_cycle(
    thing_id: &str,
    metric: Metric,
    period: Period,
    sensor: &dyn SensorSource,
    sink: &dyn DataSink,
) {
    let reading = Reading::single(thing_id, metric.sample(sensor));
    match sink.push_data(&reading).await {
        Ok(()) => info!(thing = %thing_id, values = ?reading.values, %period, "reading sent"),
        Err(e) => warn!(thing = %thing_id, values = ?reading.values, "reading not sent: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::RecordingPlatform;
    use crate::platform::{Connector, Registry};
    use crate::sensor::testing::ScriptedBarometer;
    use crate::sensor::CachedSensor;
    use tokio::time::{sleep, Instant};

    const TEMPERATURE: &str = "BME280 TEMPERATURE";
    const PRESSURE: &str = "BME280 PRESSURE";

    fn sensor(
        temperatures: Vec<Result<f32, ()>>,
        pressures: Vec<Result<f32, ()>>,
    ) -> Arc<CachedSensor<ScriptedBarometer>> {
        let script = std::sync::Mutex::new(Some(ScriptedBarometer::new(temperatures, pressures)));
        let sensor = CachedSensor::new(move || {
            Ok(script.lock().unwrap().take().unwrap_or_default())
        });
        sensor.start();
        Arc::new(sensor)
    }

    async fn setup(
        sensor: Arc<CachedSensor<ScriptedBarometer>>,
    ) -> (Arc<RecordingPlatform>, PublishScheduler) {
        let (platform, _events) = RecordingPlatform::new();
        platform.connect().await.unwrap();
        let mut scheduler = PublishScheduler::new(sensor, platform.clone());
        scheduler.add_stream(TEMPERATURE, Metric::Temperature);
        scheduler.add_stream(PRESSURE, Metric::Pressure);
        (platform, scheduler)
    }

    fn gaps(pushes: &[(Instant, f32)]) -> Vec<Duration> {
        pushes.windows(2).map(|w| w[1].0 - w[0].0).collect()
    }

    #[test]
    fn zero_frequency_means_default() {
        assert_eq!(Period::from_millis(0), Period::Every(DEFAULT_PERIOD));
        assert_eq!(Period::from_millis(500), Period::Every(Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_once_immediately_then_every_period() {
        for (period_ms, run_ms) in [(1000u64, 5500u64), (300, 1000), (7, 50)] {
            let (platform, mut scheduler) = setup(sensor(vec![Ok(20.0)], vec![Ok(1.0)])).await;
            let start = Instant::now();
            scheduler.reconfigure(TEMPERATURE, Period::from_millis(period_ms));
            sleep(Duration::from_millis(run_ms)).await;
            scheduler.stop_all();

            let pushes = platform.pushes_for(TEMPERATURE);
            assert_eq!(pushes.len() as u64, run_ms / period_ms + 1, "period {period_ms}");
            assert_eq!(pushes[0].0, start);
            for gap in gaps(&pushes) {
                assert!(gap >= Duration::from_millis(period_ms));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_cancels_the_pending_cycle() {
        let (platform, mut scheduler) = setup(sensor(vec![Ok(20.0)], vec![Ok(1.0)])).await;
        platform.set_push_delay(Duration::from_millis(300));

        scheduler.reconfigure(PRESSURE, Period::from_millis(1000));
        sleep(Duration::from_millis(100)).await;
        // first push is still in flight here
        scheduler.reconfigure(PRESSURE, Period::from_millis(1000));
        sleep(Duration::from_millis(100)).await;
        scheduler.reconfigure(PRESSURE, Period::from_millis(2000));
        sleep(Duration::from_millis(2700)).await;

        assert_eq!(platform.max_in_flight(PRESSURE), 1);
        // two aborted mid-push; the last lands at 500ms and again at 2800ms
        assert_eq!(platform.pushes_for(PRESSURE).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_fault_republishes_last_value() {
        let readings = vec![Ok(21.0), Err(()), Err(()), Ok(23.0)];
        let (platform, mut scheduler) = setup(sensor(readings, vec![Ok(1.0)])).await;
        scheduler.reconfigure(TEMPERATURE, Period::from_millis(100));
        sleep(Duration::from_millis(450)).await;

        let values: Vec<f32> = platform
            .pushes_for(TEMPERATURE)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec![21.0, 21.0, 21.0, 23.0, 23.0]);
        assert!(scheduler.is_scheduled(TEMPERATURE));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_period_publishes_once() {
        let (platform, mut scheduler) = setup(sensor(vec![Ok(20.0)], vec![Ok(1.0)])).await;
        scheduler.reconfigure(TEMPERATURE, Period::Stopped);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(platform.pushes_for(TEMPERATURE).len(), 1);
        assert!(!scheduler.is_scheduled(TEMPERATURE));
    }

    #[tokio::test(start_paused = true)]
    async fn start_all_seeds_from_stored_configuration() {
        let (platform, mut scheduler) = setup(sensor(vec![Ok(20.0)], vec![Ok(1.0)])).await;
        platform.set_stored_frequency(PRESSURE, 2000);
        let stored = platform.clone();
        scheduler.start_all(|id| stored.stored_frequency(id));

        assert_eq!(scheduler.period(TEMPERATURE), Some(Period::Every(DEFAULT_PERIOD)));
        assert_eq!(
            scheduler.period(PRESSURE),
            Some(Period::Every(Duration::from_millis(2000)))
        );
        sleep(Duration::from_millis(4500)).await;
        assert_eq!(platform.pushes_for(TEMPERATURE).len(), 5);
        assert_eq!(platform.pushes_for(PRESSURE).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_unschedules_and_push_failures_keep_running() {
        let (platform, mut scheduler) = setup(sensor(vec![Ok(20.0)], vec![Ok(1.0)])).await;
        scheduler.start_all(|_| None);
        sleep(Duration::from_millis(10)).await;
        assert!(scheduler.is_scheduled(TEMPERATURE));

        platform.drop_connection("test");
        sleep(Duration::from_millis(2500)).await;
        assert!(scheduler.is_scheduled(TEMPERATURE));
        assert_eq!(platform.pushes_for(TEMPERATURE).len(), 1);

        scheduler.stop_all();
        assert!(!scheduler.is_scheduled(TEMPERATURE));
        assert!(!scheduler.is_scheduled(PRESSURE));
    }

    #[tokio::test]
    async fn unknown_stream_is_ignored() {
        let (_platform, mut scheduler) = setup(sensor(vec![Ok(20.0)], vec![Ok(1.0)])).await;
        assert!(!scheduler.reconfigure("BME280 HUMIDITY", Period::from_millis(10)));
        assert_eq!(scheduler.stream_ids().count(), 2);
    }
}
