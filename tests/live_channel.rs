use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use httptest::matchers::{all_of, request};
use httptest::responders::json_encoded;
use httptest::{cycle, Expectation, Server};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use owid_importer::models::TaskProcessStatus;
use owid_importer::{
    ActivityJournal, ApiClient, AppConfig, ImportDraft, ImportSession, ImportSettings,
    SessionPhase, SessionStore, StoredSession, TaskStatus, TaskType, WatchObserver, WatchUpdate,
};

const WAIT: Duration = Duration::from_secs(5);

enum Push {
    Frame(Message),
    Drop,
}

/// Stand-in for the backend's push endpoint: accepts one connection at a
/// time, records every text frame the client sends, and plays back whatever
/// the test pushes. `Drop` severs the stream without a close handshake; a
/// later connect is served by a fresh accept.
struct PushServer {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<String>,
    pushes: mpsc::UnboundedSender<Push>,
}

impl PushServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (pushes, mut push_rx) = mpsc::unbounded_channel::<Push>();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(mut socket) = accept_async(stream).await else {
                    return;
                };
                loop {
                    tokio::select! {
                        incoming = socket.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                let _ = frame_tx.send(text);
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                        outgoing = push_rx.recv() => match outgoing {
                            Some(Push::Frame(message)) => {
                                if socket.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Some(Push::Drop) => break,
                            None => return,
                        },
                    }
                }
            }
        });

        Self {
            addr,
            frames,
            pushes,
        }
    }

    fn push(&self, message: Message) {
        self.pushes
            .send(Push::Frame(message))
            .expect("push server alive");
    }

    fn sever(&self) {
        self.pushes.send(Push::Drop).expect("push server alive");
    }

    async fn next_frame(&mut self) -> String {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("push server alive")
    }
}

fn session_fixture(server: &Server, push: &PushServer) -> (ImportSession, TempDir) {
    let dir = tempdir().expect("tempdir");
    let config = AppConfig {
        api_base_url: server.url_str("/"),
        ws_url_override: Some(format!("ws://{}/ws", push.addr)),
        channel_reconnect_attempts: 2,
        ..AppConfig::default()
    };
    let store = SessionStore::in_memory();
    store
        .set(&StoredSession {
            session_id: "sess-1".into(),
            username: "Importer".into(),
        })
        .expect("seed session");
    let api = ApiClient::new(&config, store).expect("api client");
    let journal = ActivityJournal::new(dir.path(), &config).expect("journal");
    (ImportSession::new(api, config, journal), dir)
}

fn envelope(kind: &str, msg: &str) -> Message {
    Message::Text(json!({ "type": kind, "msg": msg }).to_string())
}

fn task_json(id: &str, status: &str) -> serde_json::Value {
    json!({
        "id": id,
        "url": "https://ourworldindata.org/grapher/share-electricity-renewables",
        "filename": "$NAME, $REGION, $YEAR.svg",
        "description": "A map",
        "status": status,
        "type": "map"
    })
}

fn process_json(id: &str, status: &str) -> serde_json::Value {
    json!({
        "id": id,
        "region": "World",
        "type": "map",
        "year": 2020,
        "status": status,
        "taskId": "task-1",
        "filename": "Renewables, World, 2020.svg"
    })
}

fn snapshot_json(status: &str) -> serde_json::Value {
    json!({
        "task": task_json("task-1", status),
        "processes": [process_json("p-1", "processing")]
    })
}

fn settled_snapshot_json() -> serde_json::Value {
    json!({
        "task": task_json("task-1", "done"),
        "processes": [process_json("p-1", "uploaded")],
        "wikiText": "{{OWID-map|chart=share-electricity-renewables}}"
    })
}

fn recording_observer() -> (WatchObserver, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer: WatchObserver = Arc::new(move |update: &WatchUpdate| {
        sink.lock().push(label(update));
    });
    (observer, seen)
}

fn label(update: &WatchUpdate) -> String {
    match update {
        WatchUpdate::Process(process) => format!("process:{}", process.status),
        WatchUpdate::TaskRefreshed(task) => format!("task:{}", task.status),
        WatchUpdate::Progress(_) => "progress".into(),
        WatchUpdate::Notice(_) => "notice".into(),
        WatchUpdate::ServerError(_) => "server-error".into(),
        WatchUpdate::WikiText(_) => "wikitext".into(),
        WatchUpdate::Reconnecting { attempt } => format!("reconnecting:{attempt}"),
        WatchUpdate::ChannelDown(close) => format!("down:clean={}", close.clean),
    }
}

#[tokio::test]
async fn observe_subscribes_once_and_loads_a_snapshot() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/task/task-1")
        ))
        .respond_with(json_encoded(snapshot_json("processing"))),
    );

    let mut push = PushServer::start().await;
    let (mut session, _dir) = session_fixture(&server, &push);

    timeout(WAIT, session.observe("task-1"))
        .await
        .expect("observe timed out")
        .expect("observe");

    let frame = push.next_frame().await;
    let decoded: serde_json::Value = serde_json::from_str(&frame).expect("subscribe json");
    assert_eq!(
        decoded,
        json!({ "action": "subscribe_task", "content": "task-1" })
    );
    assert!(push.frames.try_recv().is_err());

    assert_eq!(session.phase(), SessionPhase::Observing);
    assert_eq!(session.task_id(), Some("task-1"));
    assert_eq!(
        session.observation().task().expect("task").status,
        TaskStatus::Processing
    );
}

#[tokio::test]
async fn task_push_triggers_a_single_refetch() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/task/task-1")
        ))
        .times(2)
        .respond_with(cycle![
            json_encoded(snapshot_json("processing")),
            json_encoded(settled_snapshot_json()),
        ]),
    );

    let mut push = PushServer::start().await;
    let (mut session, _dir) = session_fixture(&server, &push);
    timeout(WAIT, session.observe("task-1"))
        .await
        .expect("observe timed out")
        .expect("observe");
    push.next_frame().await;

    push.push(envelope("task", &task_json("task-1", "done").to_string()));

    let update = timeout(WAIT, session.next_update())
        .await
        .expect("update timed out")
        .expect("update");
    match update {
        Some(WatchUpdate::TaskRefreshed(task)) => assert_eq!(task.status, TaskStatus::Done),
        other => panic!("expected a task refresh, got {other:?}"),
    }
    assert!(session.observation().is_settled());
    assert_eq!(
        session.observation().wiki_text(),
        Some("{{OWID-map|chart=share-electricity-renewables}}")
    );
}

#[tokio::test]
async fn process_push_merges_in_place_without_a_refetch() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/task/task-1")
        ))
        .respond_with(json_encoded(snapshot_json("processing"))),
    );

    let mut push = PushServer::start().await;
    let (mut session, _dir) = session_fixture(&server, &push);
    timeout(WAIT, session.observe("task-1"))
        .await
        .expect("observe timed out")
        .expect("observe");
    push.next_frame().await;

    push.push(envelope(
        "task_process",
        &process_json("p-1", "uploaded").to_string(),
    ));

    let update = timeout(WAIT, session.next_update())
        .await
        .expect("update timed out")
        .expect("update");
    assert!(matches!(update, Some(WatchUpdate::Process(_))));

    let processes = session.observation().processes();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].status, TaskProcessStatus::Uploaded);
}

#[tokio::test]
async fn a_normal_close_ends_the_channel() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/task/task-1")
        ))
        .respond_with(json_encoded(snapshot_json("processing"))),
    );

    let mut push = PushServer::start().await;
    let (mut session, _dir) = session_fixture(&server, &push);
    timeout(WAIT, session.observe("task-1"))
        .await
        .expect("observe timed out")
        .expect("observe");
    push.next_frame().await;

    push.push(Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    })));

    let update = timeout(WAIT, session.next_update())
        .await
        .expect("update timed out")
        .expect("update");
    match update {
        Some(WatchUpdate::ChannelDown(close)) => {
            assert!(close.is_normal());
            assert_eq!(close.describe(), "Connection closed");
        }
        other => panic!("expected the channel to close, got {other:?}"),
    }

    // the channel is gone, so the next poll has nothing left to report
    let after = timeout(WAIT, session.next_update())
        .await
        .expect("update timed out")
        .expect("update");
    assert!(after.is_none());
}

#[tokio::test]
async fn a_severed_connection_reports_an_unclean_close() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/task/task-1")
        ))
        .respond_with(json_encoded(snapshot_json("processing"))),
    );

    let mut push = PushServer::start().await;
    let (mut session, _dir) = session_fixture(&server, &push);
    timeout(WAIT, session.observe("task-1"))
        .await
        .expect("observe timed out")
        .expect("observe");
    push.next_frame().await;

    push.sever();

    let update = timeout(WAIT, session.next_update())
        .await
        .expect("update timed out")
        .expect("update");
    match update {
        Some(WatchUpdate::ChannelDown(close)) => {
            assert!(!close.clean);
            assert!(close.describe().starts_with("Connection error"));
        }
        other => panic!("expected an unclean close, got {other:?}"),
    }
}

#[tokio::test]
async fn watch_follows_pushes_until_the_task_settles() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/task/task-1")
        ))
        .times(2)
        .respond_with(cycle![
            json_encoded(snapshot_json("processing")),
            json_encoded(settled_snapshot_json()),
        ]),
    );

    let mut push = PushServer::start().await;
    let (mut session, _dir) = session_fixture(&server, &push);
    timeout(WAIT, session.observe("task-1"))
        .await
        .expect("observe timed out")
        .expect("observe");
    push.next_frame().await;

    push.push(envelope("progress", "Uploading World 2020"));
    push.push(envelope("task", &task_json("task-1", "done").to_string()));

    let (observer, seen) = recording_observer();
    timeout(WAIT, session.watch_until_settled(Some(observer)))
        .await
        .expect("watch timed out")
        .expect("watch");

    assert_eq!(*seen.lock(), ["progress", "task:done"]);
    assert_eq!(
        session.observation().wiki_text(),
        Some("{{OWID-map|chart=share-electricity-renewables}}")
    );
}

#[tokio::test]
async fn submitting_one_draft_starts_observing_it() {
    let mut draft = ImportDraft::blank(&ImportSettings::default());
    draft.url = "https://ourworldindata.org/grapher/share-electricity-renewables".into();
    draft.can_import = true;

    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(request::method("POST"), request::path("/task")))
            .respond_with(json_encoded(json!({ "taskId": "task-9" }))),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/task/task-9")
        ))
        .respond_with(json_encoded(json!({
            "task": task_json("task-9", "queued"),
            "processes": []
        }))),
    );

    let mut push = PushServer::start().await;
    let (mut session, _dir) = session_fixture(&server, &push);

    let outcome = timeout(WAIT, session.submit(&[draft], TaskType::Map))
        .await
        .expect("submit timed out")
        .expect("submit");

    assert_eq!(outcome.created, vec!["task-9"]);
    assert!(outcome.rejected.is_empty());
    assert_eq!(session.phase(), SessionPhase::Observing);
    assert_eq!(session.task_id(), Some("task-9"));

    let frame = push.next_frame().await;
    assert!(frame.contains("task-9"));
    assert!(push.frames.try_recv().is_err());
}

#[tokio::test]
async fn watch_reconnects_after_an_unclean_close() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/task/task-1")
        ))
        .times(2)
        .respond_with(cycle![
            json_encoded(snapshot_json("processing")),
            json_encoded(settled_snapshot_json()),
        ]),
    );

    let mut push = PushServer::start().await;
    let (mut session, _dir) = session_fixture(&server, &push);
    timeout(WAIT, session.observe("task-1"))
        .await
        .expect("observe timed out")
        .expect("observe");
    push.next_frame().await;

    push.sever();

    let (observer, seen) = recording_observer();
    timeout(Duration::from_secs(10), session.watch_until_settled(Some(observer)))
        .await
        .expect("watch timed out")
        .expect("watch");

    // the replacement connection re-subscribed to the same task
    let frame = push.next_frame().await;
    assert!(frame.contains("task-1"));

    assert_eq!(*seen.lock(), ["down:clean=false", "reconnecting:1"]);
    assert!(session.observation().is_settled());
}
