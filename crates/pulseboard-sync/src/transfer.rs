//! Bulk transfer orchestration.
//!
//! A transfer opens a [`Channel`] to the transfer endpoint and listens on it
//! for progress and completion signals only. The bytes themselves move over
//! independent lanes started through a [`LaneLauncher`], one per declared
//! resource per round. The server assigns the session id that names the
//! lanes through a `setSocketId` fragment.
//!
//! ```text
//! Idle -> Armed -> Active -> Cancelling -> Complete
//!                        \----------------^
//! ```

use crate::channel::{Channel, ChannelEvent, Disconnect, Transport, TransportEvent};
use crate::control::DocumentControl;
use crate::error::{ProtocolError, Result, SyncError};
use crate::fragment::{FragmentArg, FragmentCall, GenericOpPolicy};
use crate::prefs::PreferenceStore;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, error, info, warn};
use url::Url;

pub const DEFAULT_BATCH_SIZE_BYTES: u64 = 8 * 1024 * 1024;
pub const MIN_BATCH_SIZE_BYTES: u64 = 1024 * 1024;
pub const MAX_BATCH_SIZE_BYTES: u64 = 256 * 1024 * 1024;

/// Name of the bare control bound on the transfer channel.
pub const TRANSFER_CONTROL: &str = "BulkDownloadDataWsg";

pub const TRIGGER_START: &str = "Start Download";
pub const TRIGGER_CANCEL: &str = "Cancel Download";
pub const TRIGGER_CANCELLING: &str = "Cancelling..";

const FRAGMENT_SET_SOCKET_ID: &str = "setSocketId";
const FRAGMENT_SET_PROGRESS: &str = "setProgress";
const FRAGMENT_BATCH_END: &str = "onBatchEnd";
const FRAGMENT_FINISHED: &str = "onFinished";

pub fn clamp_batch_size(bytes: u64) -> u64 {
    bytes.clamp(MIN_BATCH_SIZE_BYTES, MAX_BATCH_SIZE_BYTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Armed,
    Active,
    Cancelling,
    Complete,
}

impl TransferState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Active => "active",
            Self::Cancelling => "cancelling",
            Self::Complete => "complete",
        }
    }

    pub fn in_flight(self) -> bool {
        matches!(self, Self::Armed | Self::Active | Self::Cancelling)
    }
}

/// A boolean filter the user toggles before a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecl {
    pub name: String,
    pub default: bool,
}

impl FilterDecl {
    pub fn new(name: impl Into<String>, default: bool) -> Self {
        Self {
            name: name.into(),
            default,
        }
    }
}

/// A lane resource opened each round, optionally only when a filter is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneDecl {
    pub resource: String,
    pub required_filter: Option<String>,
}

impl LaneDecl {
    pub fn always(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            required_filter: None,
        }
    }

    pub fn when(resource: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            required_filter: Some(filter.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceFilter {
    pub provider_id: String,
    pub place_id: String,
}

/// Static description of what a transfer may request.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Control channel endpoint; the request goes in its query.
    pub endpoint: Url,
    /// Origin the lane paths are resolved against.
    pub lane_base: Url,
    pub filters: Vec<FilterDecl>,
    pub lanes: Vec<LaneDecl>,
    pub place: Option<PlaceFilter>,
    pub start_epoch_ms: Option<i64>,
    pub end_epoch_ms: Option<i64>,
}

impl TransferPlan {
    pub fn new(endpoint: Url, lane_base: Url) -> Self {
        Self {
            endpoint,
            lane_base,
            filters: Vec::new(),
            lanes: Vec::new(),
            place: None,
            start_epoch_ms: None,
            end_epoch_ms: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterDecl) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_lane(mut self, lane: LaneDecl) -> Self {
        self.lanes.push(lane);
        self
    }
}

/// Parameters captured when a transfer starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// In declaration order.
    pub filters: Vec<(String, bool)>,
    pub batch_size_bytes: u64,
    pub place: Option<PlaceFilter>,
    pub start_epoch_ms: Option<i64>,
    pub end_epoch_ms: Option<i64>,
}

impl TransferRequest {
    /// Filters first, then the fixed parameters. False filters are sent too.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        pairs.push(("batchSizeBytes".to_string(), self.batch_size_bytes.to_string()));
        if let Some(place) = &self.place {
            pairs.push(("provider_id".to_string(), place.provider_id.clone()));
            pairs.push(("place_id".to_string(), place.place_id.clone()));
        }
        if let Some(start) = self.start_epoch_ms {
            pairs.push(("start_epoch".to_string(), start.to_string()));
        }
        if let Some(end) = self.end_epoch_ms {
            pairs.push(("end_epoch".to_string(), end.to_string()));
        }
        pairs
    }

    pub fn query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query_pairs())
            .finish()
    }

    pub fn filter(&self, name: &str) -> bool {
        self.filters
            .iter()
            .any(|(filter, value)| filter == name && *value)
    }
}

/// Server-assigned identity of one lane.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LaneId {
    pub session_id: String,
    pub resource: String,
}

impl LaneId {
    pub fn url(&self, lane_base: &Url, instance_id: &str) -> Result<Url> {
        Ok(lane_base.join(&format!(
            "/instance/{}/bulk_download_provider/{}/{}",
            instance_id, self.session_id, self.resource
        ))?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneStatus {
    Pending,
    Running,
    Finished { bytes: u64 },
    Failed(String),
}

/// Lane progress, tagged with the round the lane was launched in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneEvent {
    Running { lane: LaneId, round: u32 },
    Finished { lane: LaneId, round: u32, bytes: u64 },
    Failed { lane: LaneId, round: u32, reason: String },
}

impl LaneEvent {
    pub fn lane(&self) -> &LaneId {
        match self {
            Self::Running { lane, .. } | Self::Finished { lane, .. } | Self::Failed { lane, .. } => lane,
        }
    }

    pub fn round(&self) -> u32 {
        match self {
            Self::Running { round, .. } | Self::Finished { round, .. } | Self::Failed { round, .. } => *round,
        }
    }
}

/// Starts lanes. Lanes run on their own; completion comes back as
/// [`LaneEvent`]s through [`BulkTransfer::lane_event`].
pub trait LaneLauncher {
    fn launch(&mut self, lane: &LaneId, round: u32, url: Url) -> Result<()>;
}

/// Launcher that only records launches. Clones share one record.
#[derive(Debug, Clone, Default)]
pub struct MemoryLauncher {
    launched: Rc<RefCell<Vec<(LaneId, u32, Url)>>>,
    refused: Option<String>,
}

impl MemoryLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher that fails every launch of `resource`.
    pub fn refusing(resource: impl Into<String>) -> Self {
        Self {
            refused: Some(resource.into()),
            ..Self::default()
        }
    }

    pub fn launched(&self) -> Vec<(LaneId, u32, Url)> {
        self.launched.borrow().clone()
    }
}

impl LaneLauncher for MemoryLauncher {
    fn launch(&mut self, lane: &LaneId, round: u32, url: Url) -> Result<()> {
        if self.refused.as_deref() == Some(lane.resource.as_str()) {
            return Err(SyncError::Transport(format!("lane {} refused", lane.resource)));
        }
        self.launched.borrow_mut().push((lane.clone(), round, url));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueLabel {
    Continue,
    Complete,
}

impl ContinueLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "Continue Download",
            Self::Complete => "Download Complete",
        }
    }
}

/// User-facing controls of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affordances {
    pub trigger_label: &'static str,
    pub trigger_enabled: bool,
    pub continue_enabled: bool,
    pub continue_label: ContinueLabel,
}

impl Default for Affordances {
    fn default() -> Self {
        Self {
            trigger_label: TRIGGER_START,
            trigger_enabled: true,
            continue_enabled: false,
            continue_label: ContinueLabel::Continue,
        }
    }
}

/// Rendered progress, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    pub total: f64,
    pub batch: f64,
}

impl Progress {
    pub fn is_full(&self) -> bool {
        self.total >= 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferOutcome {
    Completed,
    /// Closed by this side before full progress.
    Cancelled { progress: f64 },
    Interrupted { progress: f64 },
}

impl TransferOutcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Interrupted { progress } => Err(SyncError::TransferInterrupted { progress }),
            Self::Completed | Self::Cancelled { .. } => Ok(()),
        }
    }
}

/// Everything tied to one start of a transfer.
#[derive(Debug)]
pub struct TransferSession<T: Transport> {
    pub channel: Channel<T>,
    pub request: TransferRequest,
    pub instance_id: Option<String>,
    pub session_id: Option<String>,
    /// Lanes of the current round only.
    pub lanes: BTreeMap<LaneId, LaneStatus>,
    /// Zero until the first round launches.
    pub round: u32,
}

impl<T: Transport> TransferSession<T> {
    /// True once every lane of the current round has finished or failed.
    pub fn lanes_settled(&self) -> bool {
        self.lanes
            .values()
            .all(|status| matches!(status, LaneStatus::Finished { .. } | LaneStatus::Failed(_)))
    }

    fn lane_ids(&self, plan: &TransferPlan) -> Option<Vec<LaneId>> {
        let session_id = self.session_id.as_ref()?;
        Some(
            plan.lanes
                .iter()
                .filter(|lane| {
                    lane.required_filter
                        .as_deref()
                        .is_none_or(|filter| self.request.filter(filter))
                })
                .map(|lane| LaneId {
                    session_id: session_id.clone(),
                    resource: lane.resource.clone(),
                })
                .collect(),
        )
    }
}

pub struct BulkTransfer<T: Transport, P: PreferenceStore, L: LaneLauncher> {
    plan: TransferPlan,
    prefs: P,
    launcher: L,
    batch_size_bytes: u64,
    state: TransferState,
    affordances: Affordances,
    progress: Progress,
    outcome: Option<TransferOutcome>,
    session: Option<TransferSession<T>>,
}

impl<T: Transport, P: PreferenceStore, L: LaneLauncher> BulkTransfer<T, P, L> {
    pub fn new(plan: TransferPlan, prefs: P, launcher: L) -> Self {
        Self {
            plan,
            prefs,
            launcher,
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            state: TransferState::Idle,
            affordances: Affordances::default(),
            progress: Progress::default(),
            outcome: None,
            session: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn affordances(&self) -> Affordances {
        self.affordances
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn outcome(&self) -> Option<TransferOutcome> {
        self.outcome
    }

    pub fn session(&self) -> Option<&TransferSession<T>> {
        self.session.as_ref()
    }

    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    pub fn prefs(&self) -> &P {
        &self.prefs
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn batch_size_bytes(&self) -> u64 {
        self.batch_size_bytes
    }

    fn reject(&self, action: &'static str) -> SyncError {
        SyncError::InvalidTransition {
            state: self.state.as_str(),
            action,
        }
    }

    /// Set the batch size, clamped to the allowed range.
    pub fn set_batch_size(&mut self, bytes: u64) -> Result<u64> {
        if self.state.in_flight() {
            return Err(self.reject("change batch size"));
        }
        self.batch_size_bytes = clamp_batch_size(bytes);
        Ok(self.batch_size_bytes)
    }

    /// Persist a filter toggle. Undeclared names are stored but never sent.
    pub fn set_filter(&mut self, name: &str, value: bool) -> Result<()> {
        if self.state.in_flight() {
            return Err(self.reject("change filters"));
        }
        self.prefs.set_bool(name, value);
        Ok(())
    }

    pub fn filter_value(&self, name: &str) -> Option<bool> {
        let declared = self.plan.filters.iter().find(|filter| filter.name == name)?;
        Some(self.prefs.get_bool(name).unwrap_or(declared.default))
    }

    /// Snapshot the current filters and parameters.
    pub fn build_request(&self) -> TransferRequest {
        TransferRequest {
            filters: self
                .plan
                .filters
                .iter()
                .map(|filter| {
                    let value = self.prefs.get_bool(&filter.name).unwrap_or(filter.default);
                    (filter.name.clone(), value)
                })
                .collect(),
            batch_size_bytes: self.batch_size_bytes,
            place: self.plan.place.clone(),
            start_epoch_ms: self.plan.start_epoch_ms,
            end_epoch_ms: self.plan.end_epoch_ms,
        }
    }

    /// Open the control channel for a new transfer.
    pub fn start(&mut self, transport: T) -> Result<()> {
        if !matches!(self.state, TransferState::Idle | TransferState::Complete) {
            return Err(self.reject("start"));
        }
        let request = self.build_request();
        let mut url = self.plan.endpoint.clone();
        url.set_query(Some(&request.query_string()));

        let policy = GenericOpPolicy::deny_all()
            .allow_fragment(FRAGMENT_SET_SOCKET_ID)
            .allow_fragment(FRAGMENT_SET_PROGRESS)
            .allow_fragment(FRAGMENT_BATCH_END)
            .allow_fragment(FRAGMENT_FINISHED);
        let mut channel = Channel::connect(url, transport, policy)?;
        channel.bind(Box::new(DocumentControl::new(TRANSFER_CONTROL)))?;

        info!(url = %channel.url(), "bulk transfer starting");
        self.session = Some(TransferSession {
            channel,
            request,
            instance_id: None,
            session_id: None,
            lanes: BTreeMap::new(),
            round: 0,
        });
        self.state = TransferState::Armed;
        self.outcome = None;
        self.progress = Progress::default();
        self.affordances = Affordances {
            trigger_label: TRIGGER_CANCEL,
            ..Affordances::default()
        };
        Ok(())
    }

    /// Ask the server to stop. The outcome is decided when the channel closes.
    pub fn cancel(&mut self) -> Result<()> {
        if !matches!(self.state, TransferState::Armed | TransferState::Active) {
            return Err(self.reject("cancel"));
        }
        let Some(session) = self.session.as_mut() else {
            return Err(self.reject("cancel"));
        };
        self.state = TransferState::Cancelling;
        self.affordances.trigger_label = TRIGGER_CANCELLING;
        self.affordances.trigger_enabled = false;
        info!("bulk transfer cancelling");
        session.channel.close(true);
        Ok(())
    }

    /// Start another round of lanes on the same control channel.
    pub fn continue_transfer(&mut self) -> Result<()> {
        if self.state != TransferState::Active {
            return Err(self.reject("continue"));
        }
        self.affordances.continue_enabled = false;
        self.launch_lanes()
    }

    /// Feed one transport event of the control channel.
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<TransferOutcome> {
        let session = self.session.as_mut()?;
        match session.channel.handle_event(event) {
            ChannelEvent::Opened => {
                if self.state == TransferState::Armed {
                    self.state = TransferState::Active;
                    info!("bulk transfer active");
                }
                None
            }
            ChannelEvent::Dispatched(_) => {
                for call in session.channel.drain_fragments() {
                    if let Err(error) = self.apply_fragment(&call) {
                        warn!(call = %call, "{error}");
                    }
                }
                None
            }
            ChannelEvent::Disconnected(disconnect) => Some(self.on_disconnect(disconnect)),
            ChannelEvent::Errored(_) | ChannelEvent::Ignored => None,
        }
    }

    /// Record progress reported by a lane.
    pub fn lane_event(&mut self, event: LaneEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if event.round() != session.round {
            debug!(
                resource = %event.lane().resource,
                round = event.round(),
                current = session.round,
                "event for earlier round ignored"
            );
            return;
        }
        let (lane, status) = match event {
            LaneEvent::Running { lane, .. } => {
                debug!(resource = %lane.resource, "lane running");
                (lane, LaneStatus::Running)
            }
            LaneEvent::Finished { lane, bytes, .. } => {
                info!(resource = %lane.resource, bytes, "lane finished");
                (lane, LaneStatus::Finished { bytes })
            }
            LaneEvent::Failed { lane, reason, .. } => {
                error!(resource = %lane.resource, reason = %reason, "lane failed");
                (lane, LaneStatus::Failed(reason))
            }
        };
        if let Some(current) = session.lanes.get_mut(&lane) {
            *current = status;
        } else {
            debug!(resource = %lane.resource, "event for unknown lane ignored");
        }
    }

    fn apply_fragment(&mut self, call: &FragmentCall) -> Result<()> {
        let invalid = || ProtocolError::FragmentRejected(format!("{call} has invalid arguments"));
        match call.name.as_str() {
            FRAGMENT_SET_SOCKET_ID => {
                let (Some(instance), Some(socket)) = (call.arg(0), call.arg(1)) else {
                    return Err(invalid().into());
                };
                if let Some(session) = self.session.as_mut() {
                    session.instance_id = Some(instance.to_text());
                    session.session_id = Some(socket.to_text());
                    info!(instance = %instance.to_text(), session = %socket.to_text(), "transfer session assigned");
                }
                self.launch_lanes()
            }
            FRAGMENT_SET_PROGRESS => {
                let bar = call.arg(0).and_then(FragmentArg::as_str).ok_or_else(invalid)?;
                let percent = call
                    .arg(1)
                    .and_then(FragmentArg::as_f64)
                    .ok_or_else(invalid)?
                    .clamp(0.0, 100.0);
                match bar {
                    "total" => self.progress.total = percent,
                    "batch" => self.progress.batch = percent,
                    _ => return Err(invalid().into()),
                }
                debug!(bar, percent, "transfer progress");
                Ok(())
            }
            FRAGMENT_BATCH_END => {
                self.affordances.continue_enabled = true;
                debug!("transfer batch ended");
                Ok(())
            }
            FRAGMENT_FINISHED => {
                info!("bulk transfer finished by server");
                if let Some(session) = self.session.as_mut() {
                    session.channel.close(true);
                }
                Ok(())
            }
            other => Err(ProtocolError::FragmentRejected(format!("{other} is not handled")).into()),
        }
    }

    fn launch_lanes(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(self.reject("launch lanes"));
        };
        if !session.channel.is_open() {
            return Err(SyncError::NotOpen);
        }
        let (Some(instance_id), Some(lanes)) = (session.instance_id.clone(), session.lane_ids(&self.plan))
        else {
            return Err(ProtocolError::FragmentRejected(
                "no transfer session assigned yet".to_string(),
            )
            .into());
        };
        let targets = lanes
            .into_iter()
            .map(|lane| -> Result<(Url, LaneId)> {
                Ok((lane.url(&self.plan.lane_base, &instance_id)?, lane))
            })
            .collect::<Result<Vec<_>>>()?;

        // A lane that cannot launch is recorded as failed so the round still settles.
        let round = session.round + 1;
        let mut statuses = BTreeMap::new();
        let mut first_error = None;
        for (url, lane) in targets {
            debug!(url = %url, round, "launching lane");
            let status = match self.launcher.launch(&lane, round, url) {
                Ok(()) => LaneStatus::Pending,
                Err(error) => {
                    error!(resource = %lane.resource, round, "lane launch failed: {error}");
                    let status = LaneStatus::Failed(error.to_string());
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                    status
                }
            };
            statuses.insert(lane, status);
        }
        session.round = round;
        session.lanes = statuses;
        first_error.map_or(Ok(()), Err)
    }

    fn on_disconnect(&mut self, disconnect: Disconnect) -> TransferOutcome {
        self.affordances.trigger_label = TRIGGER_START;
        self.affordances.trigger_enabled = true;
        self.affordances.continue_enabled = false;

        let progress = self.progress.total;
        let outcome = match (disconnect.graceful, self.progress.is_full()) {
            (false, false) => {
                error!(code = ?disconnect.code, "{}", SyncError::TransferInterrupted { progress });
                self.state = TransferState::Idle;
                TransferOutcome::Interrupted { progress }
            }
            (true, true) => {
                self.affordances.continue_label = ContinueLabel::Complete;
                self.state = TransferState::Complete;
                TransferOutcome::Completed
            }
            (true, false) => {
                self.state = TransferState::Complete;
                TransferOutcome::Cancelled { progress }
            }
            (false, true) => {
                self.state = TransferState::Complete;
                TransferOutcome::Completed
            }
        };
        info!(outcome = ?outcome, "bulk transfer closed");
        self.outcome = Some(outcome);
        outcome
    }
}
