//! Real-time multiplexed widget synchronization.
//!
//! A single [`Channel`] carries envelopes for many named widgets. Row widgets
//! keep an ordered, optionally bounded [`RowCollection`]; map widgets keep
//! [`LayeredItems`] with per-group visibility. [`BulkTransfer`] drives long
//! downloads over a channel of the same kind.
//!
//! Delivery is fire-and-forget: envelopes carry no sequence numbers or
//! acknowledgements, are applied in arrival order, and a lost frame is not
//! detected. Views converge only as far as the sender's stream is complete.

pub mod channel;
pub mod collection;
pub mod control;
pub mod error;
pub mod fragment;
pub mod layers;
pub mod outbound;
pub mod prefs;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod view;

pub use channel::{
    Channel, ChannelEvent, ChannelState, Disconnect, MemoryTransport, MessageReport, Transport,
    TransportEvent,
};
pub use collection::{
    AddOutcome, Backing, CollectionConfig, EvictionEdge, HookPhase, RowCollection, WriteMode,
};
pub use control::{Control, DocumentControl, MapControl, RowControl};
pub use error::{ProtocolError, RegistryConflict, Result, SyncError};
pub use fragment::{FragmentArg, FragmentCall, GenericOpPolicy, parse_fragment};
pub use layers::{GroupVisibility, LayeredItems, MapItem, Placement};
pub use outbound::{ControlWriter, batch};
pub use prefs::{MemoryPreferences, PreferenceStore};
pub use protocol::{
    CellDescriptor, Coord, GenericOp, MapItemPayload, Operation, OperationCode, RowIndex,
    RowPayload, Shape, WidgetOp, keepalive_frame,
};
pub use registry::KeyedRegistry;
pub use transfer::{
    Affordances, BulkTransfer, ContinueLabel, FilterDecl, LaneDecl, LaneEvent, LaneId,
    LaneLauncher, LaneStatus, MemoryLauncher, PlaceFilter, Progress, TransferOutcome,
    TransferPlan, TransferRequest, TransferSession, TransferState,
};
pub use view::{Document, MemoryDocument, MemoryMount, MountPoint, NodeId, NodeKind};
