//! [`PresenceWatcher`] – wake the kiosk when someone touches it.
//!
//! Discovery is a polling loop: open a feed over all matching devices; if
//! none exist, or once the feed fails or ends, wait `rediscover` and try
//! again.  Qualifying events pass through a [`Debounce`]; each accepted one
//! requests `set_desired(true)`.
//!
//! Wake requests run as their own tasks so a slow power command never stops
//! the watcher from draining input.

use std::sync::Arc;
use std::time::Duration;

use kiosk_hal::{PresenceSource, TouchEvent};
use kiosk_types::{Event, EventPayload};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::store::DesiredStateStore;

pub const DEFAULT_QUIET: Duration = Duration::from_secs(5);
pub const DEFAULT_REDISCOVER: Duration = Duration::from_secs(10);

/// Accepts an event only if at least `quiet` has elapsed since the last
/// accepted one.
#[derive(Debug, Clone)]
pub struct Debounce {
    quiet: Duration,
    last_accepted: Option<Instant>,
}

impl Debounce {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            last_accepted: None,
        }
    }

    pub fn accept(&mut self, at: Instant) -> bool {
        if let Some(last) = self.last_accepted
            && at.saturating_duration_since(last) < self.quiet
        {
            return false;
        }
        self.last_accepted = Some(at);
        true
    }
}

enum FeedEnd {
    Cancelled,
    Failed,
}

pub struct PresenceWatcher {
    store: Arc<DesiredStateStore>,
    source: Box<dyn PresenceSource>,
    debounce: Debounce,
    rediscover: Duration,
    wakes: JoinSet<()>,
}

impl PresenceWatcher {
    pub fn new(store: Arc<DesiredStateStore>, source: Box<dyn PresenceSource>) -> Self {
        Self {
            store,
            source,
            debounce: Debounce::new(DEFAULT_QUIET),
            rediscover: DEFAULT_REDISCOVER,
            wakes: JoinSet::new(),
        }
    }

    pub fn with_quiet(mut self, quiet: Duration) -> Self {
        self.debounce = Debounce::new(quiet);
        self
    }

    pub fn with_rediscover(mut self, rediscover: Duration) -> Self {
        self.rediscover = rediscover;
        self
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!("presence watcher started");
        loop {
            let opened = tokio::select! {
                _ = token.cancelled() => break,
                opened = self.source.open() => opened,
            };
            match opened {
                Ok(mut feed) => {
                    if let FeedEnd::Cancelled = self.drain(&mut feed, &token).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, retry_in = ?self.rediscover, "no presence devices");
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.rediscover) => {}
            }
        }
        while self.wakes.join_next().await.is_some() {}
        info!("presence watcher stopped");
    }

    async fn drain(
        &mut self,
        feed: &mut kiosk_hal::PresenceFeed,
        token: &CancellationToken,
    ) -> FeedEnd {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return FeedEnd::Cancelled,
                next = feed.recv() => next,
            };
            match next {
                Some(Ok(event)) => self.handle(event),
                Some(Err(e)) => {
                    warn!(error = %e, "input device failed; rediscovering");
                    return FeedEnd::Failed;
                }
                None => {
                    warn!("input devices gone; rediscovering");
                    return FeedEnd::Failed;
                }
            }
            while self.wakes.try_join_next().is_some() {}
        }
    }

    fn handle(&mut self, event: TouchEvent) {
        if !self.debounce.accept(event.timestamp) {
            trace!(device = %event.device_id, "presence event debounced");
            return;
        }
        info!(device = %event.device_id, kind = ?event.kind, "presence detected; requesting wake");
        self.store.bus().publish(Event::new(
            "kiosk-kernel::presence",
            EventPayload::WakeRequested {
                device: event.device_id,
            },
        ));
        let store = Arc::clone(&self.store);
        self.wakes.spawn(async move {
            if let Err(e) = store.set_desired(true, false).await {
                warn!(error = %e, "wake request failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::PowerActuator;
    use crate::supervisor::ProcessSupervisor;
    use kiosk_hal::TouchKind;
    use kiosk_hal::sim::{CallLog, SimDisplay, SimFeed, SimLauncher, SimPresence};
    use kiosk_middleware::{EventBus, Topic};
    use kiosk_types::{KioskError, PowerState};

    fn store(log: &CallLog) -> Arc<DesiredStateStore> {
        Arc::new(DesiredStateStore::new(
            PowerActuator::new(Box::new(SimDisplay::new("HDMI-A-2", log.clone())))
                .with_settle(Duration::ZERO),
            ProcessSupervisor::new(Box::new(SimLauncher::new(log.clone()))),
            EventBus::default(),
        ))
    }

    fn touch(at: Instant) -> Result<TouchEvent, KioskError> {
        Ok(TouchEvent {
            device_id: "/dev/input/event4".to_string(),
            timestamp: at,
            kind: TouchKind::AbsoluteAxis,
        })
    }

    async fn send_all(tx: &SimFeed, events: Vec<Result<TouchEvent, KioskError>>) {
        for e in events {
            tx.send(e).await.unwrap();
        }
    }

    #[test]
    fn debounce_uses_elapsed_since_last_accepted() {
        let base = Instant::now();
        let mut d = Debounce::new(Duration::from_secs(5));
        assert!(d.accept(base));
        assert!(!d.accept(base + Duration::from_secs(1)));
        assert!(!d.accept(base + Duration::from_secs(4)));
        assert!(d.accept(base + Duration::from_secs(5)));
        assert!(!d.accept(base + Duration::from_secs(6)));
        assert!(d.accept(base + Duration::from_secs(11)));
    }

    #[tokio::test(start_paused = true)]
    async fn events_one_second_apart_wake_once() {
        let log = CallLog::default();
        let store = store(&log);
        let presence = SimPresence::new(log.clone());
        let tx = presence.push_feed();
        let mut wakes = store.bus().subscribe_to(Topic::Presence);

        let token = CancellationToken::new();
        let handle = tokio::spawn(
            PresenceWatcher::new(Arc::clone(&store), Box::new(presence)).run(token.clone()),
        );

        let base = Instant::now();
        send_all(&tx, vec![touch(base), touch(base + Duration::from_secs(1))]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(wakes.try_recv().is_ok());
        assert!(wakes.try_recv().is_err(), "second event debounced");
        assert_eq!(store.observed_on(), PowerState::On);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn events_six_seconds_apart_wake_twice() {
        let log = CallLog::default();
        let store = store(&log);
        let presence = SimPresence::new(log.clone());
        let tx = presence.push_feed();
        let mut wakes = store.bus().subscribe_to(Topic::Presence);

        let token = CancellationToken::new();
        let handle = tokio::spawn(
            PresenceWatcher::new(Arc::clone(&store), Box::new(presence)).run(token.clone()),
        );

        let base = Instant::now();
        send_all(&tx, vec![touch(base), touch(base + Duration::from_secs(6))]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(wakes.try_recv().is_ok());
        assert!(wakes.try_recv().is_ok());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_devices_backs_off_and_rediscovers() {
        let log = CallLog::default();
        let presence = SimPresence::new(log.clone());
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            PresenceWatcher::new(store(&log), Box::new(presence.clone())).run(token.clone()),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(presence.opens(), 1);
        tokio::time::sleep(DEFAULT_REDISCOVER).await;
        assert_eq!(presence.opens(), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn device_failure_triggers_rediscovery() {
        let log = CallLog::default();
        let store = store(&log);
        let presence = SimPresence::new(log.clone());
        let first = presence.push_feed();
        let second = presence.push_feed();
        let mut wakes = store.bus().subscribe_to(Topic::Presence);

        let token = CancellationToken::new();
        let handle = tokio::spawn(
            PresenceWatcher::new(Arc::clone(&store), Box::new(presence.clone()))
                .run(token.clone()),
        );

        first
            .send(Err(KioskError::Device {
                device: "/dev/input/event4".into(),
                details: "No such device".into(),
            }))
            .await
            .unwrap();
        tokio::time::sleep(DEFAULT_REDISCOVER + Duration::from_millis(100)).await;
        assert_eq!(presence.opens(), 2);

        second.send(touch(Instant::now())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(wakes.try_recv().is_ok());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let log = CallLog::default();
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            PresenceWatcher::new(store(&log), Box::new(SimPresence::new(log.clone())))
                .run(token.clone()),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watcher must stop promptly")
            .unwrap();
    }
}
