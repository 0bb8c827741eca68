//! Pluggable location provider.
//!
//! The session does not talk to any positioning hardware directly; it asks
//! a [`LocationSource`] for the last known fix and a periodic fix stream.
//! The pump task bridges the source to the service loop so that starting
//! and stopping updates never blocks the session.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::location::LocationSample;

/// Source of GPS fixes.
#[async_trait]
pub trait LocationSource: Send + Sync + 'static {
    /// The most recent fix the provider already holds, if any.
    async fn last_known(&self) -> Option<LocationSample>;

    /// A stream delivering fixes at roughly the requested interval.
    /// Dropping the stream unsubscribes.
    async fn subscribe(&self, interval: Duration) -> BoxStream<'static, LocationSample>;
}

/// How the session turns location updates on and off. The real
/// implementation forwards to the pump task; tests record the calls.
pub trait LocationUpdates: Send {
    fn start(&self);
    fn stop(&self);
}

/// Control messages consumed by the pump task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationCtl {
    Start,
    Stop,
}

/// [`LocationUpdates`] implementation backed by the pump's control channel.
pub struct ChannelLocationUpdates {
    ctl: mpsc::UnboundedSender<LocationCtl>,
}

impl ChannelLocationUpdates {
    pub fn new(ctl: mpsc::UnboundedSender<LocationCtl>) -> Self {
        Self { ctl }
    }
}

impl LocationUpdates for ChannelLocationUpdates {
    fn start(&self) {
        let _ = self.ctl.send(LocationCtl::Start);
    }

    fn stop(&self) {
        let _ = self.ctl.send(LocationCtl::Stop);
    }
}

async fn next_fix(
    stream: &mut Option<BoxStream<'static, LocationSample>>,
) -> Option<LocationSample> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

/// Spawns the task that owns the provider subscription.
///
/// On `Start` the pump first forwards the last known fix (so the camera gets
/// a position immediately) and then subscribes at `interval`. On `Stop` the
/// subscription is dropped. Fixes always flow through `fixes`, never
/// directly into session state.
pub fn spawn_location_pump<S: LocationSource>(
    source: S,
    interval: Duration,
    mut ctl: mpsc::UnboundedReceiver<LocationCtl>,
    fixes: mpsc::UnboundedSender<LocationSample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream: Option<BoxStream<'static, LocationSample>> = None;

        loop {
            tokio::select! {
                msg = ctl.recv() => match msg {
                    Some(LocationCtl::Start) => {
                        if stream.is_none() {
                            info!("Starting location updates");
                            if let Some(fix) = source.last_known().await {
                                let _ = fixes.send(fix);
                            }
                            stream = Some(source.subscribe(interval).await);
                        }
                    }
                    Some(LocationCtl::Stop) => {
                        if stream.take().is_some() {
                            info!("Stopped location updates");
                        }
                    }
                    None => break,
                },
                fix = next_fix(&mut stream) => match fix {
                    Some(fix) => {
                        let _ = fixes.send(fix);
                    }
                    None => {
                        debug!("Location stream ended");
                        stream = None;
                    }
                },
            }
        }
    })
}

/// Fixed-position source configured by the user, for hosts without real
/// positioning hardware (a desk, a studio, a car mount with a known spot).
#[derive(Debug, Clone)]
pub struct StaticLocationSource {
    latitude: f64,
    longitude: f64,
    accuracy_m: f64,
}

impl StaticLocationSource {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m,
        }
    }

    fn sample(&self) -> LocationSample {
        LocationSample {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_m: self.accuracy_m,
            fix_time_ms: Utc::now().timestamp_millis(),
            provider: "static".to_string(),
        }
    }
}

#[async_trait]
impl LocationSource for StaticLocationSource {
    async fn last_known(&self) -> Option<LocationSample> {
        Some(self.sample())
    }

    async fn subscribe(&self, interval: Duration) -> BoxStream<'static, LocationSample> {
        let source = self.clone();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        Box::pin(futures_util::stream::unfold(
            (source, ticker),
            |(source, mut ticker)| async move {
                ticker.tick().await;
                let fix = source.sample();
                Some((fix, (source, ticker)))
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_forwards_last_known_then_periodic_fixes() {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (fix_tx, mut fix_rx) = mpsc::unbounded_channel();
        let source = StaticLocationSource::new(35.6586, 139.7454, 10.0);
        let pump = spawn_location_pump(source, Duration::from_millis(10), ctl_rx, fix_tx);

        ctl_tx.send(LocationCtl::Start).unwrap();
        let first = fix_rx.recv().await.unwrap();
        assert_eq!(first.provider, "static");
        assert!((first.latitude - 35.6586).abs() < f64::EPSILON);
        // the subscription keeps delivering
        assert!(fix_rx.recv().await.is_some());

        ctl_tx.send(LocationCtl::Stop).unwrap();
        drop(ctl_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn pump_is_quiet_until_started() {
        let (_ctl_tx, ctl_rx) = mpsc::unbounded_channel::<LocationCtl>();
        let (fix_tx, mut fix_rx) = mpsc::unbounded_channel();
        let source = StaticLocationSource::new(0.0, 0.0, 1.0);
        let _pump = spawn_location_pump(source, Duration::from_millis(5), ctl_rx, fix_tx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(fix_rx.try_recv().is_err());
    }
}
