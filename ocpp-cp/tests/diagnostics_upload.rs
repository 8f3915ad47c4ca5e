//! GetDiagnostics end to end: a mock CSMS asks the charge point to upload
//! to a real diag-sink receiver (or to a failing endpoint).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use diag_sink::{SinkEvent, SinkState};
use futures_util::{SinkExt, StreamExt};
use ocpp_cp::ocpp::{decode, encode_call, encode_result, Frame};
use ocpp_cp::{
    Action, ChargePointBuilder, Correlator, CpConfig, DiagnosticsWorkflow, Dispatcher, EventBus,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

async fn start_sink(dir: &std::path::Path) -> (SocketAddr, SinkState, oneshot::Sender<()>) {
    let state = SinkState::new(dir);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(diag_sink::serve(listener, state.clone(), async move {
        let _ = stopped.await;
    }));
    (addr, state, stop)
}

/// Endpoint that always answers 500 and counts requests
async fn start_failing_endpoint() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/upload",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, hits)
}

async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return decode(text.as_bytes()).unwrap();
        }
    }
}

async fn reply(ws: &mut WebSocketStream<TcpStream>, message_id: &str, payload: Value) {
    ws.send(Message::Text(encode_result(message_id, &payload).into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_diagnostics_uploads_to_sink() {
    let dir = tempfile::tempdir().unwrap();
    let (sink_addr, sink_state, stop_sink) = start_sink(dir.path()).await;
    let mut sink_events = sink_state.subscribe();

    let csms = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let csms_addr = csms.local_addr().unwrap();
    let cp = ChargePointBuilder::new()
        .charge_point_id("CP-DIAG")
        .csms_url(format!("ws://{}/ocpp", csms_addr))
        .build()
        .unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let cp_task = tokio::spawn(cp.run(stop_rx));

    let (stream, _) = csms.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, |_: &Request, mut resp: Response| {
        resp.headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ocpp1.6"));
        Ok(resp)
    })
    .await
    .unwrap();

    let boot = match next_frame(&mut ws).await {
        Frame::Call(call) => call,
        other => panic!("Expected BootNotification, got {:?}", other),
    };
    assert_eq!(boot.action, "BootNotification");
    reply(&mut ws, &boot.message_id, json!({"status": "Accepted", "interval": 300})).await;

    let location = format!("http://{}/upload", sink_addr);
    ws.send(Message::Text(
        encode_call("csms-diag", "GetDiagnostics", &json!({"location": location})).into(),
    ))
    .await
    .unwrap();

    // Answer every CALL, collect what matters until the final status
    let mut file_name = None;
    let mut statuses = Vec::new();
    while !statuses.iter().any(|s| s == "Uploaded" || s == "UploadFailed") {
        match next_frame(&mut ws).await {
            Frame::CallResult(result) if result.message_id == "csms-diag" => {
                file_name = result.payload["fileName"].as_str().map(str::to_string);
            }
            Frame::Call(call) => {
                if call.action == "DiagnosticsStatusNotification" {
                    assert!(file_name.is_some(), "status sent before the GetDiagnostics reply");
                    statuses.push(call.payload["status"].as_str().unwrap().to_string());
                }
                reply(&mut ws, &call.message_id, json!({})).await;
            }
            _ => {}
        }
    }
    assert_eq!(statuses, vec!["Uploading", "Uploaded"]);

    let file_name = file_name.unwrap();
    assert!(file_name.starts_with("diagnostics_CP-DIAG_"));

    let event = tokio::time::timeout(Duration::from_secs(5), sink_events.recv())
        .await
        .expect("sink event in time")
        .unwrap();
    match event {
        SinkEvent::UploadReceived {
            filename,
            original_name,
            analysis,
            ..
        } => {
            assert_eq!(original_name, file_name);
            assert!(filename.ends_with(&file_name));
            assert!(dir.path().join(&filename).exists());
            assert!(analysis.is_zip);
            let entries = analysis.extracted_files.unwrap();
            for expected in [
                "etc/wpa_supplicant/wpa_supplicant.conf",
                "etc/chargepoint/ocpp.conf",
                "var/log/chargepoint/system_info.log",
                "var/log/chargepoint/error.log",
                "diagnostics.txt",
            ] {
                assert!(entries.iter().any(|e| e == expected), "{} missing", expected);
            }
            assert!(analysis.matches.iter().any(|m| m.keyword == "psk"));
        }
    }

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), cp_task)
        .await
        .expect("stopped in time")
        .unwrap()
        .unwrap();
    let _ = stop_sink.send(());
}

#[tokio::test]
async fn test_server_error_is_reported_without_retry() {
    let (addr, hits) = start_failing_endpoint().await;

    let config = CpConfig::new("CP-FAIL", "ws://localhost:9000/ocpp");
    let correlator = Correlator::new(Duration::from_secs(30));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    correlator.attach(Arc::new(tx));

    let workflow = DiagnosticsWorkflow::new(&config, correlator.clone(), EventBus::default());
    let mut dispatcher = Dispatcher::new(correlator);
    dispatcher.register(Action::GetDiagnostics, workflow);

    dispatcher
        .dispatch(
            "gd-fail",
            "GetDiagnostics",
            json!({"location": format!("http://{}/upload", addr), "retries": 5, "retryInterval": 1}),
        )
        .expect("upload follow-up")
        .await
        .unwrap();

    let mut frames = Vec::new();
    while let Ok(text) = rx.try_recv() {
        frames.push(decode(text.as_bytes()).unwrap());
    }

    assert!(matches!(&frames[0], Frame::CallResult(r) if r.message_id == "gd-fail"));
    let statuses: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Call(call) if call.action == "DiagnosticsStatusNotification" => {
                call.payload["status"].as_str().map(str::to_string)
            }
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec!["Uploading", "UploadFailed"]);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_location_fails() {
    // Bind then drop to get a port with nothing behind it
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let config = CpConfig::new("CP-NOWHERE", "ws://localhost:9000/ocpp");
    let correlator = Correlator::new(Duration::from_secs(30));
    let (tx, _rx) = mpsc::unbounded_channel::<String>();
    correlator.attach(Arc::new(tx));

    let workflow = DiagnosticsWorkflow::new(&config, correlator, EventBus::default());
    let status = workflow
        .upload(ocpp_cp::diagnostics::DiagnosticsJob {
            location: format!("http://{}/upload", addr),
            file_name: workflow.file_name(),
        })
        .await;
    assert_eq!(status, ocpp_cp::ocpp::DiagnosticsStatus::UploadFailed);
}
