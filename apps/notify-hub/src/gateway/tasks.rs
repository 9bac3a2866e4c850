//! Repeating timers: keepalive, entity room pings, inactivity sweep, spool
//! drains, and the bus subscriber.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::Config;

use super::hub::Hub;
use super::subscriber;

/// Handles of every background task, aborted together on shutdown.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

/// Run `tick` every `period`, starting one period from now.
fn every<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            tick().await;
        }
    })
}

impl BackgroundTasks {
    pub fn spawn(hub: Arc<Hub>, config: &Config) -> Self {
        let mut handles = Vec::new();

        let h = hub.clone();
        handles.push(every(config.keepalive_interval, move || {
            let hub = h.clone();
            async move {
                hub.send_keepalive();
            }
        }));

        let h = hub.clone();
        handles.push(every(config.room_ping_interval, move || {
            let hub = h.clone();
            async move {
                hub.ping_entity_rooms();
            }
        }));

        let h = hub.clone();
        let threshold = config.inactivity_threshold;
        handles.push(every(config.sweep_interval, move || {
            let hub = h.clone();
            async move {
                hub.sweep_inactive(threshold);
            }
        }));

        let h = hub.clone();
        handles.push(every(config.spool_poll_interval, move || {
            let hub = h.clone();
            async move {
                hub.drain_notification_spool().await;
            }
        }));

        let h = hub.clone();
        handles.push(every(config.session_spool_poll_interval, move || {
            let hub = h.clone();
            async move {
                hub.drain_session_spool().await;
            }
        }));

        let h = hub.clone();
        handles.push(every(config.session_spool_poll_interval, move || {
            let hub = h.clone();
            async move {
                hub.drain_room_spool().await;
            }
        }));

        handles.push(tokio::spawn(subscriber::run(hub)));

        tracing::info!(
            keepalive_secs = config.keepalive_interval.as_secs(),
            room_ping_secs = config.room_ping_interval.as_secs(),
            sweep_secs = config.sweep_interval.as_secs(),
            inactivity_secs = config.inactivity_threshold.as_secs(),
            spool_dir = %config.spool_dir.display(),
            "background tasks started"
        );
        Self { handles }
    }

    pub fn abort_all(self) {
        for handle in &self.handles {
            handle.abort();
        }
        tracing::info!(tasks = self.handles.len(), "background tasks stopped");
    }
}
