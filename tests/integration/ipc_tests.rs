//! Integration tests for the local control socket: authentication and
//! command dispatch to the session host.

use std::sync::Arc;

use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::GenericNamespaced;
use serde_json::{json, Value};
use serial_test::serial;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use fenix::ipc::server::{publish_token, spawn_ipc_server, token_path, IpcState};
use fenix::session::SessionHost;

use crate::support::driver::FakeDriverFactory;
use crate::support::game::{FakePlatform, GameSpec};
use crate::support::{Harness, PASSWORD};

const TOKEN: &str = "test-token";

struct Server {
    name: String,
    host: Arc<SessionHost>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Server {
    fn start(auth_token: Option<&str>) -> Self {
        let harness = Harness::new(
            FakePlatform::new(GameSpec::default()),
            FakeDriverFactory::new(true),
            PASSWORD,
        );
        let host = Arc::new(SessionHost::new(harness.context()));
        host.create("idle", Vec::new()).unwrap();

        let name = format!("fenix-test-{}", uuid::Uuid::new_v4().simple());
        let shutdown = CancellationToken::new();
        let state = Arc::new(IpcState {
            host: Arc::clone(&host),
            auth_token: auth_token.map(str::to_owned),
        });
        let task = spawn_ipc_server(&name, state, shutdown.clone()).unwrap();
        Self {
            name,
            host,
            shutdown,
            task,
        }
    }

    async fn connect(&self) -> Client {
        let name = self.name.clone().to_ns_name::<GenericNamespaced>().unwrap();
        let stream = Stream::connect(name).await.unwrap();
        let (read, write) = stream.split();
        Client {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap();
    }
}

struct Client {
    lines: tokio::io::Lines<BufReader<interprocess::local_socket::tokio::RecvHalf>>,
    write: interprocess::local_socket::tokio::SendHalf,
}

impl Client {
    async fn send_raw(&mut self, line: &str) -> Value {
        self.write.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let reply = self.lines.next_line().await.unwrap().expect("server closed");
        serde_json::from_str(&reply).unwrap()
    }

    async fn send(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await
    }
}

#[tokio::test]
async fn requests_without_the_token_are_unauthorized() {
    let server = Server::start(Some(TOKEN));
    let mut client = server.connect().await;

    let reply = client.send(json!({"command": "list"})).await;
    assert_eq!(reply, json!({"ok": false, "error": "unauthorized"}));
    let reply = client
        .send(json!({"command": "list", "auth_token": "guess"}))
        .await;
    assert_eq!(reply["error"], "unauthorized");

    let reply = client
        .send(json!({"command": "list", "auth_token": TOKEN}))
        .await;
    assert_eq!(reply["ok"], true);
    server.stop().await;
}

#[tokio::test]
async fn list_reports_every_session() {
    let server = Server::start(None);
    let mut client = server.connect().await;

    let reply = client.send(json!({"command": "list"})).await;
    assert_eq!(reply["ok"], true);
    let sessions = reply["data"]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["name"], "idle");
    assert_eq!(sessions[0]["status"], "idle");
    assert_eq!(sessions[0]["paused"], false);
    assert_eq!(sessions[0]["target_pid"], Value::Null);
    server.stop().await;
}

#[tokio::test]
async fn control_verbs_reach_the_host() {
    let server = Server::start(Some(TOKEN));
    let mut client = server.connect().await;
    let command = |verb: &str| json!({"command": verb, "session": "idle", "auth_token": TOKEN});

    let reply = client.send(command("pause")).await;
    assert_eq!(reply, json!({"ok": true, "data": {"paused": true, "session": "idle"}}));
    assert!(server.host.list()[0].paused);

    let reply = client.send(command("resume")).await;
    assert_eq!(reply["data"]["paused"], false);

    let reply = client.send(command("start")).await;
    assert_eq!(reply["data"], json!({"started": true, "session": "idle"}));
    server.host.wait("idle").await.unwrap();

    let reply = client.send(command("stop")).await;
    assert_eq!(reply["data"]["stopping"], true);
    let reply = client.send(command("kill")).await;
    assert_eq!(reply["data"]["killed"], true);
    server.stop().await;
}

#[tokio::test]
async fn bad_requests_get_error_replies() {
    let server = Server::start(None);
    let mut client = server.connect().await;

    let reply = client
        .send(json!({"command": "start", "session": "missing"}))
        .await;
    assert_eq!(
        reply,
        json!({"ok": false, "error": "not found: no session named missing"})
    );

    let reply = client.send(json!({"command": "start"})).await;
    assert_eq!(reply["error"], "missing required 'session' field");

    let reply = client.send(json!({"command": "dance"})).await;
    assert_eq!(reply["error"], "unknown command: dance");

    let reply = client.send_raw("{not json").await;
    assert_eq!(reply["ok"], false);
    assert!(reply["error"].as_str().unwrap().starts_with("invalid json"));
    server.stop().await;
}

#[test]
#[serial]
fn token_is_published_for_the_control_client() {
    let name = format!("fenix-test-{}", uuid::Uuid::new_v4().simple());
    let path = publish_token(&name, "s3cret").unwrap();
    assert_eq!(path, token_path(&name));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "s3cret");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
    std::fs::remove_file(path).unwrap();
}
