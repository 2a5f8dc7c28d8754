use pulseboard_sync::{
    BulkTransfer, CellDescriptor, Channel, ChannelEvent, CollectionConfig, ContinueLabel,
    ControlWriter, Coord, EvictionEdge, FilterDecl, GenericOpPolicy, GroupVisibility, LaneDecl,
    MapControl, MemoryDocument, MemoryLauncher, MemoryPreferences, MemoryTransport, MessageReport,
    Result, RowCollection, RowControl, RowIndex, SyncError, TransferOutcome, TransferPlan,
    TransferState, TransportEvent, batch, keepalive_frame,
};
use serde_json::{Map, Value, json};
use url::Url;

fn open_channel() -> Result<(Channel<MemoryTransport>, MemoryTransport)> {
    let transport = MemoryTransport::new();
    let mut channel = Channel::connect(
        Url::parse("ws://dash.local/instance/17/socket")?,
        transport.clone(),
        GenericOpPolicy::deny_all(),
    )?;
    channel.handle_event(TransportEvent::Opened);
    Ok((channel, transport))
}

fn bind_rows(
    channel: &mut Channel<MemoryTransport>,
    document: &MemoryDocument,
    name: &str,
    config: CollectionConfig,
) -> Result<()> {
    document.add_region(format!("{name}_contents"));
    document.add_region(format!("{name}_header"));
    let collection = RowCollection::attach(document, name, config)?;
    channel.bind(Box::new(RowControl::new(collection)))
}

fn deliver(channel: &mut Channel<MemoryTransport>, frame: &Value) -> MessageReport {
    match channel.handle_event(TransportEvent::Message(frame.to_string())) {
        ChannelEvent::Dispatched(report) => report,
        _ => MessageReport::default(),
    }
}

fn row_contents(document: &MemoryDocument, name: &str) -> Vec<String> {
    document
        .rows(&format!("{name}_contents"))
        .into_iter()
        .map(|cells| cells.join("|"))
        .collect()
}

#[test]
fn add_then_remove_leaves_widget_empty() -> Result<()> {
    let document = MemoryDocument::new();
    let (mut channel, _) = open_channel()?;
    bind_rows(&mut channel, &document, "t", CollectionConfig::default())?;

    let add = json!({"t": {"op": 4, "hashKey": "u1", "cells": ["c0"], "rowIndex": 0}});
    let remove = json!({"t": {"op": 3, "hashKey": "u1"}});
    assert!(deliver(&mut channel, &add).is_clean());
    assert!(deliver(&mut channel, &remove).is_clean());

    assert!(row_contents(&document, "t").is_empty());
    let empty = channel
        .control("t")
        .and_then(|control| control.rows())
        .is_some_and(RowCollection::is_empty);
    assert!(empty);
    Ok(())
}

#[test]
fn remove_before_add_fails_closed() -> Result<()> {
    let document = MemoryDocument::new();
    let (mut channel, _) = open_channel()?;
    bind_rows(&mut channel, &document, "t", CollectionConfig::default())?;

    let writer = ControlWriter::new("t");
    let report = deliver(&mut channel, &writer.remove_item("u1"));
    assert_eq!(report.errors.len(), 1);
    let report = deliver(
        &mut channel,
        &writer.add_row("u1", vec![CellDescriptor::new("x")], RowIndex::Head, None),
    );
    assert!(report.is_clean());
    assert_eq!(row_contents(&document, "t"), vec!["x"]);
    Ok(())
}

#[test]
fn update_keeps_identity_and_position() -> Result<()> {
    let document = MemoryDocument::new();
    let (mut channel, _) = open_channel()?;
    bind_rows(&mut channel, &document, "users", CollectionConfig::default())?;
    let writer = ControlWriter::new("users");

    for key in ["a", "b", "c"] {
        let frame = writer.add_row(key, vec![CellDescriptor::new(key)], RowIndex::Append, None);
        assert!(deliver(&mut channel, &frame).is_clean());
    }
    let node_before = channel
        .control("users")
        .and_then(|control| control.rows())
        .and_then(|rows| rows.row_node("b"));

    let frame = json!({"users": {
        "op": 6,
        "hashKey": "b",
        "cells": [["B", "bold"]],
        "rowIndex": 0,
        "rowClass": "flash"
    }});
    assert!(deliver(&mut channel, &frame).is_clean());

    let rows = channel.control("users").and_then(|control| control.rows());
    assert_eq!(rows.and_then(|rows| rows.row_node("b")), node_before);
    assert_eq!(rows.and_then(|rows| rows.position("b")), Some(1));
    assert_eq!(row_contents(&document, "users"), vec!["a", "B", "c"]);
    Ok(())
}

#[test]
fn bounded_feed_keeps_newest_rows() -> Result<()> {
    let document = MemoryDocument::new();
    let (mut channel, _) = open_channel()?;
    bind_rows(
        &mut channel,
        &document,
        "feed",
        CollectionConfig::bounded(3, EvictionEdge::Tail),
    )?;
    let writer = ControlWriter::new("feed");
    for index in 0..6 {
        let key = format!("t{index}");
        let frame = writer.add_row(key.as_str(), vec![CellDescriptor::new(key.as_str())], RowIndex::Head, None);
        assert!(deliver(&mut channel, &frame).is_clean());
    }
    assert_eq!(row_contents(&document, "feed"), vec!["t5", "t4", "t3"]);
    Ok(())
}

#[test]
fn header_rows_stack() -> Result<()> {
    let document = MemoryDocument::new();
    let (mut channel, _) = open_channel()?;
    bind_rows(&mut channel, &document, "users", CollectionConfig::default())?;
    let writer = ControlWriter::new("users");
    let header = vec![
        CellDescriptor::new("Name").with_class("span6"),
        CellDescriptor::new("Location").with_class("span6"),
    ];
    deliver(&mut channel, &writer.set_header(header.clone(), Some("row-fluid")));
    deliver(&mut channel, &writer.set_header(header, Some("row-fluid")));
    assert_eq!(
        document.rows("users_header"),
        vec![
            vec!["Name".to_string(), "Location".to_string()],
            vec!["Name".to_string(), "Location".to_string()],
        ]
    );
    Ok(())
}

#[test]
fn map_group_hidden_before_first_item() -> Result<()> {
    let (mut channel, _) = open_channel()?;
    channel.bind(Box::new(MapControl::new("map")))?;
    if let Some(layers) = channel.control_mut("map").and_then(|control| control.layers_mut()) {
        layers.hide_group("g");
    }

    let mut properties = Map::new();
    properties.insert("custom_layers".to_string(), json!(["g"]));
    let frame = ControlWriter::new("map").add_marker("m1", Coord { lat: 10.0, lng: 20.0 }, properties, None);
    assert!(deliver(&mut channel, &frame).is_clean());

    let layers = channel.control("map").and_then(|control| control.layers());
    assert_eq!(layers.map(|layers| layers.visibility("g")), Some(GroupVisibility::Hidden));
    assert_eq!(layers.map(|layers| layers.contains("m1")), Some(true));
    assert_eq!(layers.map(|layers| layers.is_attached("m1")), Some(false));
    Ok(())
}

#[test]
fn one_frame_can_address_several_widgets_and_keepalive() -> Result<()> {
    let document = MemoryDocument::new();
    let (mut channel, transport) = open_channel()?;
    bind_rows(&mut channel, &document, "a", CollectionConfig::default())?;
    bind_rows(&mut channel, &document, "b", CollectionConfig::default())?;

    let frame = batch([
        ControlWriter::new("a").add_row("1", vec![CellDescriptor::new("one")], RowIndex::Head, None),
        ControlWriter::new("b").add_row("2", vec![CellDescriptor::new("two")], RowIndex::Head, None),
        json!({"c": {"op": 4, "hashKey": "3", "cells": []}}),
        ControlWriter::new("a").remove_item("missing"),
    ]);
    let report = deliver(&mut channel, &frame);
    assert_eq!(report.dispatched, vec!["b".to_string()]);
    assert_eq!(report.errors.len(), 2);
    assert_eq!(row_contents(&document, "b"), vec!["two"]);

    let report = deliver(&mut channel, &keepalive_frame());
    assert!(report.keepalive);
    assert_eq!(transport.sent(), vec!["PING_BACK".to_string()]);
    Ok(())
}

#[test]
fn unknown_op_code_is_dropped_without_closing() -> Result<()> {
    let document = MemoryDocument::new();
    let (mut channel, _) = open_channel()?;
    bind_rows(&mut channel, &document, "t", CollectionConfig::default())?;
    let report = deliver(&mut channel, &json!({"t": {"op": 5, "hashKey": "x"}}));
    assert_eq!(report.errors.len(), 1);
    assert!(channel.is_open());
    Ok(())
}

fn transfer_plan(filters: &[(&str, bool)]) -> Result<TransferPlan> {
    let mut plan = TransferPlan::new(
        Url::parse("ws://dash.local/bulk_download")?,
        Url::parse("http://dash.local")?,
    )
    .with_lane(LaneDecl::always("user_tunnel"));
    for (name, default) in filters {
        plan = plan.with_filter(FilterDecl::new(*name, *default));
    }
    Ok(plan)
}

fn fragment(source: &str) -> TransportEvent {
    let frame = json!({"BulkDownloadDataWsg": {"op": 9, "javascript": source}});
    TransportEvent::Message(frame.to_string())
}

#[test]
fn transfer_query_lists_filters_then_batch_size() -> Result<()> {
    let transport = MemoryTransport::new();
    let mut transfer = BulkTransfer::new(
        transfer_plan(&[("a", true), ("b", false)])?,
        MemoryPreferences::new(),
        MemoryLauncher::new(),
    );
    transfer.set_batch_size(1_048_576)?;
    assert_eq!(
        transfer.build_request().query_string(),
        "a=true&b=false&batchSizeBytes=1048576"
    );
    transfer.start(transport.clone())?;
    assert_eq!(
        transport.opened_url().and_then(|url| url.query().map(ToString::to_string)),
        Some("a=true&b=false&batchSizeBytes=1048576".to_string())
    );
    Ok(())
}

#[test]
fn graceful_close_at_full_progress_completes() -> Result<()> {
    let mut transfer = BulkTransfer::new(
        transfer_plan(&[])?,
        MemoryPreferences::new(),
        MemoryLauncher::new(),
    );
    transfer.start(MemoryTransport::new())?;
    transfer.handle_event(TransportEvent::Opened);
    assert_eq!(transfer.state(), TransferState::Active);

    transfer.handle_event(fragment("setProgress('total', 100); onFinished();"));
    let outcome = transfer.handle_event(TransportEvent::Closed { code: Some(1000) });

    assert_eq!(outcome, Some(TransferOutcome::Completed));
    assert_eq!(transfer.state(), TransferState::Complete);
    assert_eq!(transfer.affordances().continue_label, ContinueLabel::Complete);
    Ok(())
}

#[test]
fn ungraceful_close_reports_interruption() -> Result<()> {
    let mut transfer = BulkTransfer::new(
        transfer_plan(&[])?,
        MemoryPreferences::new(),
        MemoryLauncher::new(),
    );
    transfer.start(MemoryTransport::new())?;
    transfer.handle_event(TransportEvent::Opened);
    transfer.handle_event(fragment("setProgress('total', 60);"));
    transfer.handle_event(TransportEvent::Error("connection reset".to_string()));
    let outcome = transfer.handle_event(TransportEvent::Closed { code: Some(1006) });

    let result = outcome.map(TransferOutcome::into_result);
    assert!(matches!(
        result,
        Some(Err(SyncError::TransferInterrupted { progress })) if (progress - 60.0).abs() < f64::EPSILON
    ));
    let affordances = transfer.affordances();
    assert_eq!(affordances.continue_label, ContinueLabel::Continue);
    assert!(!affordances.continue_enabled);
    assert!(affordances.trigger_enabled);
    Ok(())
}
