//! Serialized event loops.
//!
//! Transport callbacks, lane completions and stop requests are merged into a
//! single task so that channel and transfer state are only touched from one
//! place, one event at a time.

use crate::error::{ClientError, Result};
use crate::lanes::LaneEvents;
use crate::transport::TransportEvents;
use pulseboard_sync::{
    BulkTransfer, Channel, ChannelEvent, Disconnect, LaneLauncher, PreferenceStore,
    TransferOutcome, TransferSession, Transport,
};
use std::future::Future;
use tracing::{debug, info, warn};

/// Drive a channel until it disconnects. `stop` resolving asks for a graceful
/// close; `observe` sees every channel event after it is applied.
pub async fn run_channel<T, S, O>(
    channel: &mut Channel<T>,
    events: &mut TransportEvents,
    stop: S,
    mut observe: O,
) -> Result<Disconnect>
where
    T: Transport,
    S: Future<Output = ()>,
    O: FnMut(&Channel<T>, &ChannelEvent),
{
    tokio::pin!(stop);
    let mut stop_pending = true;
    loop {
        tokio::select! {
            () = &mut stop, if stop_pending => {
                stop_pending = false;
                info!(url = %channel.url(), "stop requested");
                channel.close(true);
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(ClientError::StreamClosed("channel disconnect"));
                };
                let outcome = channel.handle_event(event);
                if let ChannelEvent::Dispatched(report) = &outcome
                    && !report.is_clean()
                {
                    debug!(errors = report.errors.len(), "message applied with errors");
                }
                observe(channel, &outcome);
                if let ChannelEvent::Disconnected(disconnect) = outcome {
                    return Ok(disconnect);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Start the next round as soon as a batch ends and its lanes settle.
    pub auto_continue: bool,
}

/// Drive a started transfer until its control channel closes. `cancel`
/// resolving cancels the transfer.
pub async fn run_transfer<T, P, L, C>(
    transfer: &mut BulkTransfer<T, P, L>,
    events: &mut TransportEvents,
    lanes: &mut LaneEvents,
    options: TransferOptions,
    cancel: C,
) -> Result<TransferOutcome>
where
    T: Transport,
    P: PreferenceStore,
    L: LaneLauncher,
    C: Future<Output = ()>,
{
    tokio::pin!(cancel);
    let mut cancel_pending = true;
    loop {
        tokio::select! {
            () = &mut cancel, if cancel_pending => {
                cancel_pending = false;
                if let Err(error) = transfer.cancel() {
                    warn!("{error}");
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(ClientError::StreamClosed("transfer outcome"));
                };
                if let Some(outcome) = transfer.handle_event(event) {
                    return Ok(outcome);
                }
            }
            Some(event) = lanes.recv() => transfer.lane_event(event),
        }
        if options.auto_continue && ready_to_continue(transfer) {
            info!("continuing bulk transfer");
            if let Err(error) = transfer.continue_transfer() {
                warn!("next round not fully launched: {error}");
            }
        }
    }
}

fn ready_to_continue<T, P, L>(transfer: &BulkTransfer<T, P, L>) -> bool
where
    T: Transport,
    P: PreferenceStore,
    L: LaneLauncher,
{
    transfer.affordances().continue_enabled
        && transfer.session().is_some_and(TransferSession::lanes_settled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulseboard_sync::{
        LaneDecl, LaneEvent, MemoryLauncher, MemoryPreferences, MemoryTransport, TransferPlan,
        TransportEvent,
    };
    use serde_json::json;
    use std::future::pending;
    use tokio::sync::mpsc;
    use url::Url;

    fn fragment(source: &str) -> TransportEvent {
        let frame = json!({"BulkDownloadDataWsg": {"op": 9, "javascript": source}});
        TransportEvent::Message(frame.to_string())
    }

    #[tokio::test]
    async fn failed_continue_keeps_the_transfer_running() -> Result<()> {
        let plan = TransferPlan::new(
            Url::parse("ws://dash.local/bulk_download")?,
            Url::parse("http://dash.local")?,
        )
        .with_lane(LaneDecl::always("user_tunnel"));
        let launcher = MemoryLauncher::refusing("user_tunnel");
        let mut transfer = BulkTransfer::new(plan, MemoryPreferences::new(), launcher);
        let transport = MemoryTransport::new();
        transfer.start(transport.clone())?;

        let (sender, mut events) = mpsc::unbounded_channel();
        let (_lane_sender, mut lanes) = mpsc::unbounded_channel::<LaneEvent>();
        for event in [
            TransportEvent::Opened,
            fragment("setSocketId('17', 's1');"),
            fragment("onBatchEnd();"),
            fragment("setProgress('total', 100); onFinished();"),
            TransportEvent::Closed { code: Some(1000) },
        ] {
            if sender.send(event).is_err() {
                return Err(ClientError::StreamClosed("test setup"));
            }
        }

        let outcome = run_transfer(
            &mut transfer,
            &mut events,
            &mut lanes,
            TransferOptions { auto_continue: true },
            pending(),
        )
        .await?;

        assert_eq!(outcome, TransferOutcome::Completed);
        assert_eq!(transfer.session().map(|session| session.round), Some(2));
        assert_eq!(transport.close_requests(), 1);
        Ok(())
    }
}
