//! One full-duplex connection multiplexing envelopes for many widgets.
//!
//! The channel never drives I/O itself. A [`Transport`] opens, sends and
//! closes; whatever owns the transport feeds back [`TransportEvent`]s in
//! arrival order through [`Channel::handle_event`]. Each event is handled to
//! completion before the next, and no per-message error escapes it.

use crate::control::Control;
use crate::error::{ProtocolError, Result, SyncError};
use crate::fragment::{FragmentCall, GenericOpPolicy};
use crate::protocol::{GenericOp, KEEPALIVE_MARKER, KEEPALIVE_REPLY, OperationCode, Operation};
use crate::view::Document;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    ClosedGraceful,
    ClosedError,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::ClosedGraceful => "closed",
            Self::ClosedError => "closed with error",
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedGraceful | Self::ClosedError)
    }
}

/// The primitive a channel runs over.
pub trait Transport {
    fn open(&mut self, url: &Url) -> Result<()>;
    fn send(&mut self, text: &str) -> Result<()>;
    fn close(&mut self);
}

/// Callbacks of a transport, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Closed { code: Option<u16> },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    /// True only when this side asked for a graceful close.
    pub graceful: bool,
    pub code: Option<u16>,
}

/// Outcome of one inbound message. Errors are recorded, never raised.
#[derive(Debug, Default)]
pub struct MessageReport {
    pub dispatched: Vec<String>,
    pub keepalive: bool,
    pub errors: Vec<(String, SyncError)>,
}

impl MessageReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Dispatched(MessageReport),
    Errored(String),
    Disconnected(Disconnect),
    Ignored,
}

type DisconnectHook = Box<dyn FnOnce(Disconnect)>;

pub struct Channel<T: Transport> {
    url: Url,
    transport: T,
    state: ChannelState,
    policy: GenericOpPolicy,
    controls: HashMap<String, Box<dyn Control>>,
    content: Option<Box<dyn Document>>,
    fragments: VecDeque<FragmentCall>,
    graceful_close: bool,
    on_disconnect: Option<DisconnectHook>,
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("url", &self.url.as_str())
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("policy", &self.policy)
            .field("controls", &self.controls.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Channel<T> {
    /// Ask `transport` to open `url`. The channel stays `Connecting` until an
    /// [`TransportEvent::Opened`] arrives.
    pub fn connect(url: Url, mut transport: T, policy: GenericOpPolicy) -> Result<Self> {
        transport.open(&url)?;
        info!(url = %url, "channel connecting");
        Ok(Self {
            url,
            transport,
            state: ChannelState::Connecting,
            policy,
            controls: HashMap::new(),
            content: None,
            fragments: VecDeque::new(),
            graceful_close: false,
            on_disconnect: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn policy(&self) -> &GenericOpPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Surface targeted by `SET_CONTENT`.
    pub fn set_content_surface(&mut self, document: Box<dyn Document>) {
        self.content = Some(document);
    }

    /// Called once, when the channel reaches a closed state.
    pub fn on_disconnect(&mut self, hook: impl FnOnce(Disconnect) + 'static) {
        self.on_disconnect = Some(Box::new(hook));
    }

    /// Bind a control under its name. Fails if the name is taken.
    pub fn bind(&mut self, control: Box<dyn Control>) -> Result<()> {
        let name = control.name().to_string();
        if self.controls.contains_key(&name) {
            return Err(SyncError::AlreadyBound(name));
        }
        debug!(widget = %name, "control bound");
        self.controls.insert(name, control);
        Ok(())
    }

    /// Bind a control, returning whatever was bound under the same name.
    pub fn rebind(&mut self, control: Box<dyn Control>) -> Option<Box<dyn Control>> {
        let name = control.name().to_string();
        let previous = self.controls.insert(name.clone(), control);
        if previous.is_some() {
            info!(widget = %name, "control rebound");
        }
        previous
    }

    pub fn unbind(&mut self, name: &str) -> Option<Box<dyn Control>> {
        self.controls.remove(name)
    }

    pub fn control(&self, name: &str) -> Option<&dyn Control> {
        self.controls.get(name).map(AsRef::as_ref)
    }

    pub fn control_mut(&mut self, name: &str) -> Option<&mut (dyn Control + 'static)> {
        self.controls.get_mut(name).map(AsMut::as_mut)
    }

    /// Accepted fragment calls, oldest first.
    pub fn drain_fragments(&mut self) -> Vec<FragmentCall> {
        self.fragments.drain(..).collect()
    }

    pub fn send(&mut self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(SyncError::NotOpen);
        }
        self.transport.send(text)
    }

    pub fn send_json(&mut self, value: &Value) -> Result<()> {
        self.send(&value.to_string())
    }

    /// Request close. `graceful` is reported back in the [`Disconnect`].
    /// Repeated calls and calls after close are no-ops.
    pub fn close(&mut self, graceful: bool) {
        if self.state == ChannelState::Closing || self.state.is_closed() {
            return;
        }
        self.graceful_close = graceful;
        self.state = ChannelState::Closing;
        info!(url = %self.url, graceful, "channel closing");
        self.transport.close();
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> ChannelEvent {
        match event {
            TransportEvent::Opened => {
                if self.state != ChannelState::Connecting {
                    return ChannelEvent::Ignored;
                }
                self.state = ChannelState::Open;
                info!(url = %self.url, "channel open");
                ChannelEvent::Opened
            }
            TransportEvent::Message(text) => {
                if self.state.is_closed() {
                    debug!("message after close dropped");
                    return ChannelEvent::Ignored;
                }
                ChannelEvent::Dispatched(self.dispatch(&text))
            }
            TransportEvent::Error(message) => {
                error!(url = %self.url, error = %message, "channel transport error");
                ChannelEvent::Errored(message)
            }
            TransportEvent::Closed { code } => self.finish(code),
        }
    }

    fn finish(&mut self, code: Option<u16>) -> ChannelEvent {
        if self.state.is_closed() {
            return ChannelEvent::Ignored;
        }
        let graceful = self.state == ChannelState::Closing && self.graceful_close;
        if graceful {
            self.state = ChannelState::ClosedGraceful;
            info!(url = %self.url, "channel closed gracefully");
        } else {
            self.state = ChannelState::ClosedError;
            error!(url = %self.url, code = ?code, "channel disconnected");
        }
        let disconnect = Disconnect { graceful, code };
        if let Some(hook) = self.on_disconnect.take() {
            hook(disconnect);
        }
        ChannelEvent::Disconnected(disconnect)
    }

    /// Route every key of one inbound frame.
    pub fn dispatch(&mut self, text: &str) -> MessageReport {
        let mut report = MessageReport::default();
        let frame = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(frame)) => frame,
            Ok(_) => {
                let error = ProtocolError::Malformed("frame is not a JSON object".to_string());
                warn!("{error}");
                report.errors.push((String::new(), error.into()));
                return report;
            }
            Err(error) => {
                let error = ProtocolError::Malformed(error.to_string());
                warn!("{error}");
                report.errors.push((String::new(), error.into()));
                return report;
            }
        };

        for (name, envelope) in &frame {
            let outcome = if self.controls.contains_key(name) {
                self.apply_envelope(name, envelope)
            } else if let Some(marker) = frame.get(KEEPALIVE_MARKER) {
                if report.keepalive {
                    continue;
                }
                self.keepalive(marker).map(|()| report.keepalive = true)
            } else {
                Err(ProtocolError::UnknownWidget(name.clone()).into())
            };
            match outcome {
                Ok(()) => {
                    if self.controls.contains_key(name) {
                        report.dispatched.push(name.clone());
                    }
                }
                Err(error) => {
                    warn!(widget = %name, "{error}");
                    report.errors.push((name.clone(), error));
                }
            }
        }
        report
    }

    fn keepalive(&mut self, marker: &Value) -> Result<()> {
        if marker.as_i64() != Some(i64::from(OperationCode::Ping.code())) {
            return Err(ProtocolError::InvalidStaticOp(marker.to_string()).into());
        }
        debug!("keepalive received");
        self.transport.send(KEEPALIVE_REPLY)
    }

    fn apply_envelope(&mut self, name: &str, envelope: &Value) -> Result<()> {
        match Operation::parse(envelope)? {
            Operation::Generic(op) => self.apply_generic(op),
            Operation::Widget(op) => {
                let control = self
                    .controls
                    .get_mut(name)
                    .ok_or_else(|| ProtocolError::UnknownWidget(name.to_string()))?;
                control.apply(op)
            }
        }
    }

    fn apply_generic(&mut self, op: GenericOp) -> Result<()> {
        match op {
            GenericOp::SetContent { element_id, html } => {
                self.policy.check_set_content()?;
                let surface = self
                    .content
                    .as_mut()
                    .ok_or_else(|| SyncError::RenderTargetMissing(element_id.clone()))?;
                surface.replace_content(&element_id, &html)
            }
            GenericOp::RunFragment { source } => {
                let calls = self.policy.admit(&source)?;
                debug!(calls = calls.len(), "fragment accepted");
                self.fragments.extend(calls);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryWire {
    opened: Option<Url>,
    sent: Vec<String>,
    close_requests: usize,
    fail_open: bool,
}

/// In-process transport that records traffic. Clones share one record.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    wire: Rc<RefCell<MemoryWire>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose `open` fails.
    pub fn refusing() -> Self {
        let transport = Self::default();
        transport.wire.borrow_mut().fail_open = true;
        transport
    }

    pub fn opened_url(&self) -> Option<Url> {
        self.wire.borrow().opened.clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.wire.borrow().sent.clone()
    }

    pub fn close_requests(&self) -> usize {
        self.wire.borrow().close_requests
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, url: &Url) -> Result<()> {
        let mut wire = self.wire.borrow_mut();
        if wire.fail_open {
            return Err(SyncError::Transport(format!("connection refused: {url}")));
        }
        wire.opened = Some(url.clone());
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<()> {
        self.wire.borrow_mut().sent.push(text.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.wire.borrow_mut().close_requests += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CollectionConfig, RowCollection};
    use crate::control::{DocumentControl, RowControl};
    use crate::error::RegistryConflict;
    use crate::view::MemoryDocument;
    use std::cell::Cell;

    fn open_channel(policy: GenericOpPolicy) -> Result<(Channel<MemoryTransport>, MemoryTransport)> {
        let transport = MemoryTransport::new();
        let url = Url::parse("ws://localhost/socket")?;
        let mut channel = Channel::connect(url, transport.clone(), policy)?;
        assert!(matches!(channel.handle_event(TransportEvent::Opened), ChannelEvent::Opened));
        Ok((channel, transport))
    }

    fn bind_rows(channel: &mut Channel<MemoryTransport>, document: &MemoryDocument, name: &str) -> Result<()> {
        document.add_region(format!("{name}_contents"));
        document.add_region(format!("{name}_header"));
        let collection = RowCollection::attach(document, name, CollectionConfig::default())?;
        channel.bind(Box::new(RowControl::new(collection)))
    }

    fn dispatched(event: ChannelEvent) -> MessageReport {
        match event {
            ChannelEvent::Dispatched(report) => report,
            _ => MessageReport::default(),
        }
    }

    #[test]
    fn bind_refuses_duplicate_names_and_rebind_returns_previous() -> Result<()> {
        let (mut channel, _) = open_channel(GenericOpPolicy::deny_all())?;
        channel.bind(Box::new(DocumentControl::new("doc")))?;
        assert!(matches!(
            channel.bind(Box::new(DocumentControl::new("doc"))),
            Err(SyncError::AlreadyBound(name)) if name == "doc"
        ));
        assert!(channel.rebind(Box::new(DocumentControl::new("doc"))).is_some());
        assert!(channel.unbind("doc").is_some());
        assert!(channel.unbind("doc").is_none());
        Ok(())
    }

    #[test]
    fn one_bad_key_does_not_block_others() -> Result<()> {
        let document = MemoryDocument::new();
        let (mut channel, _) = open_channel(GenericOpPolicy::deny_all())?;
        bind_rows(&mut channel, &document, "users")?;
        let frame = r#"{"ghost":{"op":4,"hashKey":"x","cells":["x"]},"users":{"op":4,"hashKey":"u1","cells":["alice"]}}"#;
        let report = dispatched(channel.handle_event(TransportEvent::Message(frame.to_string())));
        assert_eq!(report.dispatched, vec!["users".to_string()]);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            &report.errors[0].1,
            SyncError::Protocol(ProtocolError::UnknownWidget(name)) if name == "ghost"
        ));
        assert_eq!(document.rows("users_contents"), vec![vec!["alice".to_string()]]);
        Ok(())
    }

    #[test]
    fn registry_conflicts_are_reported_not_raised() -> Result<()> {
        let document = MemoryDocument::new();
        let (mut channel, _) = open_channel(GenericOpPolicy::deny_all())?;
        bind_rows(&mut channel, &document, "users")?;
        let remove = r#"{"users":{"op":3,"hashKey":"nobody"}}"#;
        let report = dispatched(channel.handle_event(TransportEvent::Message(remove.to_string())));
        assert!(matches!(
            report.errors.as_slice(),
            [(_, SyncError::Registry(RegistryConflict::MissingKey(_)))]
        ));
        assert!(channel.is_open());
        Ok(())
    }

    #[test]
    fn keepalive_reply_is_bare_literal() -> Result<()> {
        let (mut channel, transport) = open_channel(GenericOpPolicy::deny_all())?;
        let report = dispatched(channel.handle_event(TransportEvent::Message(r#"{"static_op":0}"#.to_string())));
        assert!(report.keepalive);
        assert!(report.is_clean());
        assert_eq!(transport.sent(), vec![KEEPALIVE_REPLY.to_string()]);

        let report = dispatched(channel.handle_event(TransportEvent::Message(r#"{"static_op":5}"#.to_string())));
        assert!(matches!(
            report.errors.as_slice(),
            [(_, SyncError::Protocol(ProtocolError::InvalidStaticOp(_)))]
        ));
        assert_eq!(transport.sent().len(), 1);
        Ok(())
    }

    #[test]
    fn malformed_frame_is_dropped() -> Result<()> {
        let (mut channel, _) = open_channel(GenericOpPolicy::deny_all())?;
        let report = dispatched(channel.handle_event(TransportEvent::Message("not json".to_string())));
        assert_eq!(report.errors.len(), 1);
        assert!(channel.is_open());
        Ok(())
    }

    #[test]
    fn generic_ops_follow_policy() -> Result<()> {
        let surface = MemoryDocument::new();
        surface.add_region("status");
        let policy = GenericOpPolicy::content_only().allow_fragment("onBatchEnd");
        let (mut channel, _) = open_channel(policy)?;
        channel.set_content_surface(Box::new(surface.clone()));
        channel.bind(Box::new(DocumentControl::new("doc")))?;

        let frame = r#"{"doc":{"op":8,"elementId":"status","html":"<b>42%</b>"}}"#;
        assert!(dispatched(channel.handle_event(TransportEvent::Message(frame.to_string()))).is_clean());
        assert_eq!(surface.region("status").map(|node| node.content), Some("<b>42%</b>".to_string()));

        let frame = r#"{"doc":{"op":9,"javascript":"onBatchEnd();"}}"#;
        assert!(dispatched(channel.handle_event(TransportEvent::Message(frame.to_string()))).is_clean());
        let frame = r#"{"doc":{"op":9,"javascript":"document.write('x')"}}"#;
        let rejected = dispatched(channel.handle_event(TransportEvent::Message(frame.to_string())));
        assert!(!rejected.is_clean());
        assert_eq!(channel.drain_fragments().len(), 1);
        Ok(())
    }

    #[test]
    fn disconnect_fires_once_with_graceful_flag() -> Result<()> {
        let (mut channel, transport) = open_channel(GenericOpPolicy::deny_all())?;
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        channel.on_disconnect(move |disconnect| {
            assert!(disconnect.graceful);
            seen.set(seen.get() + 1);
        });
        channel.close(true);
        channel.close(true);
        assert_eq!(transport.close_requests(), 1);
        assert_eq!(channel.state(), ChannelState::Closing);
        assert!(matches!(channel.send("x"), Err(SyncError::NotOpen)));

        let event = channel.handle_event(TransportEvent::Closed { code: Some(1000) });
        assert!(matches!(event, ChannelEvent::Disconnected(Disconnect { graceful: true, .. })));
        assert!(matches!(
            channel.handle_event(TransportEvent::Closed { code: Some(1000) }),
            ChannelEvent::Ignored
        ));
        assert_eq!(calls.get(), 1);
        assert_eq!(channel.state(), ChannelState::ClosedGraceful);
        Ok(())
    }

    #[test]
    fn peer_close_is_not_graceful() -> Result<()> {
        let (mut channel, _) = open_channel(GenericOpPolicy::deny_all())?;
        let event = channel.handle_event(TransportEvent::Closed { code: Some(1006) });
        assert!(matches!(
            event,
            ChannelEvent::Disconnected(Disconnect { graceful: false, code: Some(1006) })
        ));
        assert_eq!(channel.state(), ChannelState::ClosedError);
        Ok(())
    }

    #[test]
    fn messages_queued_before_close_still_dispatch() -> Result<()> {
        let document = MemoryDocument::new();
        let (mut channel, _) = open_channel(GenericOpPolicy::deny_all())?;
        bind_rows(&mut channel, &document, "t")?;
        channel.close(true);
        let frame = r#"{"t":{"op":4,"hashKey":"late","cells":["x"]}}"#;
        assert!(dispatched(channel.handle_event(TransportEvent::Message(frame.to_string()))).is_clean());
        channel.handle_event(TransportEvent::Closed { code: None });
        assert!(matches!(
            channel.handle_event(TransportEvent::Message(frame.to_string())),
            ChannelEvent::Ignored
        ));
        assert_eq!(document.rows("t_contents").len(), 1);
        Ok(())
    }

    #[test]
    fn connect_propagates_open_failure() -> Result<()> {
        let url = Url::parse("ws://localhost/socket")?;
        let result = Channel::connect(url, MemoryTransport::refusing(), GenericOpPolicy::deny_all());
        assert!(matches!(result, Err(SyncError::Transport(_))));
        Ok(())
    }
}
