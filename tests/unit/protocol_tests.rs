//! Unit tests for channel line classification and envelopes.

use serde_json::json;

use fenix::channel::protocol::{parse_line, Envelope, Inbound, StartBotParams, START_BOT};
use fenix::channel::DriverEvent;
use fenix::AppError;

#[test]
fn register_keeps_its_id() {
    let inbound = parse_line(r#"{"id":"h-1","method":"register"}"#).unwrap();
    assert_eq!(inbound, Some(Inbound::Register { id: Some("h-1".into()) }));
}

#[test]
fn notify_event_decodes_name_and_data() {
    let inbound = parse_line(
        r#"{"method":"notifyEvent","params":{"name":"OnBotStopped","data":"done"}}"#,
    )
    .unwrap();
    assert_eq!(
        inbound,
        Some(Inbound::Event {
            id: None,
            event: DriverEvent::new("OnBotStopped", "done"),
        })
    );

    let structured =
        parse_line(r#"{"method":"notifyEvent","params":{"name":"OnTick","data":{"n":1}}}"#)
            .unwrap();
    let Some(Inbound::Event { event, .. }) = structured else {
        panic!("expected event, got {structured:?}");
    };
    assert_eq!(event.data, r#"{"n":1}"#);
}

#[test]
fn notify_event_without_name_is_rejected() {
    let err = parse_line(r#"{"method":"notifyEvent","params":{"data":"x"}}"#).unwrap_err();
    assert!(
        matches!(&err, AppError::Channel(m) if m.starts_with("missing required field")),
        "{err}"
    );
}

#[test]
fn responses_carry_result_or_error() {
    assert_eq!(
        parse_line(r#"{"id":"o-1","result":true}"#).unwrap(),
        Some(Inbound::Response {
            id: "o-1".into(),
            outcome: Ok(json!(true)),
        })
    );
    assert_eq!(
        parse_line(r#"{"id":"o-2","error":"bot not found"}"#).unwrap(),
        Some(Inbound::Response {
            id: "o-2".into(),
            outcome: Err("bot not found".into()),
        })
    );
    assert_eq!(parse_line(r#"{"result":true}"#).unwrap(), None);
}

#[test]
fn unknown_methods_and_blank_lines() {
    assert_eq!(
        parse_line(r#"{"id":"h-9","method":"reticulate"}"#).unwrap(),
        Some(Inbound::Unknown {
            id: Some("h-9".into()),
            method: "reticulate".into(),
        })
    );
    assert_eq!(parse_line("   ").unwrap(), None);
    assert!(matches!(parse_line("{oops"), Err(AppError::Channel(_))));
}

#[test]
fn envelopes_omit_absent_fields() {
    let params = StartBotParams {
        bot_name: "Grind Bot".into(),
        profile_path: "p.xml".into(),
    };
    let request = Envelope::request("o-3", START_BOT, Some(serde_json::to_value(&params).unwrap()));
    let line = request.to_line().unwrap();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&line).unwrap(),
        json!({"id": "o-3", "method": "startBot", "params": {"botName": "Grind Bot", "profilePath": "p.xml"}})
    );

    let error = Envelope::error_response("h-2", "unsupported").to_line().unwrap();
    assert_eq!(error, r#"{"id":"h-2","error":"unsupported"}"#);
    assert!(!line.contains('\n'));
}
