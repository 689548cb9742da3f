use super::controller::{ControllerShared, Delivery};
use super::{SessionId, ViewId};
use crate::bus::Subscription;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Keeps one view fresh: fills its cache, then re-queries once per burst of
/// overlapping events. The debounce window opens at the first event of a
/// burst and is not extended by later ones.
pub(super) async fn run(
    shared: Arc<ControllerShared>,
    session: SessionId,
    view: ViewId,
    mut subscription: Subscription,
    mut stop: watch::Receiver<bool>,
) {
    let _ = shared.refresh(session, view).await;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if matches!(shared.deliver(session, view, &event), Delivery::Invalidated)
                    && deadline.is_none()
                {
                    deadline = Some(Instant::now() + shared.debounce);
                }
            }
            _ = wait_until(deadline) => {
                deadline = None;
                let _ = shared.refresh(session, view).await;
            }
        }
    }
    tracing::debug!(session = %session, view = %view, "view worker stopped");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
