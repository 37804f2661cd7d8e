//! Background listener feeding realtime events into the task mirror.
//!
//! The listener owns the session's subscription. When the receiver falls behind
//! it reloads the mirror; when the connection closes it resubscribes after a
//! delay (bounded number of attempts) and then reloads, so staleness after a
//! dropped connection is bounded by one full fetch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::messages::{OwnerId, RealtimeEvent, Table};
use crate::mirror::TaskMirror;
use crate::store::{RemoteStore, StreamGap, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReconnectPolicy {
    pub(crate) delay: Duration,
    pub(crate) max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1_000),
            max_attempts: 10,
        }
    }
}

/// Handle on a running listener. Stopping it releases the subscription.
pub(crate) struct RealtimeListener {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RealtimeListener {
    pub(crate) fn spawn(
        store: Arc<dyn RemoteStore>,
        mirror: Arc<TaskMirror>,
        owner: OwnerId,
        subscription: Subscription,
        policy: ReconnectPolicy,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(store, mirror, owner, subscription, policy, shutdown_rx));
        Self { shutdown, handle }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            log::error!("Realtime listener ended abnormally: {e}");
        }
    }

    /// Signal shutdown without waiting, for use from `Drop`.
    pub(crate) fn signal_stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

enum Link {
    Live(Subscription),
    Down { attempts: u32 },
}

enum Step {
    Shutdown,
    Received(Option<Result<RealtimeEvent, StreamGap>>),
    Retry,
}

async fn run(
    store: Arc<dyn RemoteStore>,
    mirror: Arc<TaskMirror>,
    owner: OwnerId,
    subscription: Subscription,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("Realtime listener started for {owner}");
    let mut link = Link::Live(subscription);

    loop {
        let step = match &mut link {
            Link::Live(subscription) => tokio::select! {
                _ = shutdown.changed() => Step::Shutdown,
                item = subscription.next() => Step::Received(item),
            },
            Link::Down { .. } => tokio::select! {
                _ = shutdown.changed() => Step::Shutdown,
                _ = tokio::time::sleep(policy.delay) => Step::Retry,
            },
        };

        match step {
            Step::Shutdown => {
                if let Link::Live(subscription) = link {
                    subscription.unsubscribe();
                }
                break;
            }
            Step::Received(Some(Ok(event))) => {
                log::debug!("Received {:?} for task {}", event.kind(), event.task().id);
                mirror.apply_remote_event(event);
            }
            Step::Received(Some(Err(gap))) => {
                log::warn!("Realtime stream skipped {} event(s), reloading", gap.missed);
                reload(&mirror, owner).await;
            }
            Step::Received(None) => {
                log::warn!("Realtime connection for {owner} closed, reconnecting");
                link = Link::Down { attempts: 0 };
            }
            Step::Retry => {
                let attempts = match link {
                    Link::Down { attempts } => attempts + 1,
                    Link::Live(_) => continue,
                };
                match store.subscribe(&owner, Table::Tasks).await {
                    Ok(subscription) => {
                        log::info!(
                            "Realtime connection for {owner} restored after {attempts} attempt(s)"
                        );
                        link = Link::Live(subscription);
                        reload(&mirror, owner).await;
                    }
                    Err(e) if attempts >= policy.max_attempts => {
                        log::error!(
                            "Giving up on realtime for {owner} after {attempts} attempt(s): {e}"
                        );
                        break;
                    }
                    Err(e) => {
                        log::warn!("Reconnect attempt {attempts} for {owner} failed: {e}");
                        link = Link::Down { attempts };
                    }
                }
            }
        }
    }
    log::info!("Realtime listener stopped for {owner}");
}

async fn reload(mirror: &TaskMirror, owner: OwnerId) {
    if let Err(e) = mirror.load(owner).await {
        log::error!("Reload after realtime gap failed: {e}");
    }
}
