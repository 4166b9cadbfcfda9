//! Drives the control client against a scripted control port.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use onionlink::control::{ControlChannel, ControlError, TorControlConnection};

const CIRCUIT_STATUS: &str = "250+circuit-status=\r\n\
1 BUILT $AAAA1111~alpha,$BBBB2222~beta PURPOSE=GENERAL TIME_CREATED=2026-01-02T03:04:05.000000\r\n\
2 EXTENDED $CCCC3333~gamma PURPOSE=HS_CLIENT_INTRO\r\n\
.\r\n\
250 OK\r\n";

struct FakeTor {
    port_file: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    _dir: tempfile::TempDir,
}

fn respond(command: &str) -> String {
    match command {
        c if c.starts_with("AUTHENTICATE 00ff") => "250 OK\r\n".to_string(),
        c if c.starts_with("AUTHENTICATE") => {
            "515 Authentication failed: Safe cookie response did not match\r\n".to_string()
        }
        "SETEVENTS STATUS_CLIENT" => "250 OK\r\n\
650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=50 TAG=loading_descriptors SUMMARY=\"Loading relay descriptors\"\r\n\
650 STATUS_GENERAL NOTICE CLOCK_JUMPED TIME=120\r\n\
650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED\r\n"
            .to_string(),
        "GETINFO net/listeners/socks" => {
            "250-net/listeners/socks=\"127.0.0.1:9150\"\r\n250 OK\r\n".to_string()
        }
        "GETINFO circuit-status" => CIRCUIT_STATUS.to_string(),
        "GETINFO garbled" => "250\u{e9}x\r\n".to_string(),
        "CLOSECIRCUIT 1" => "250 OK\r\n".to_string(),
        c if c.starts_with("CLOSECIRCUIT") => "552 Unknown circuit \"2\"\r\n".to_string(),
        c if c.starts_with("SETCONF") || c.starts_with("RESETCONF") => "250 OK\r\n".to_string(),
        "SIGNAL NEWNYM" => "250 OK\r\n".to_string(),
        _ => "510 Unrecognized command\r\n".to_string(),
    }
}

async fn fake_tor() -> FakeTor {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_file = dir.path().join("control-port");
    tokio::fs::write(
        &port_file,
        format!("PORT={}\n", listener.local_addr().unwrap()),
    )
    .await
    .unwrap();

    let commands = Arc::new(Mutex::new(Vec::new()));
    let recorded = commands.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = respond(&line);
            recorded.lock().unwrap().push(line);
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    FakeTor {
        port_file,
        commands,
        _dir: dir,
    }
}

#[tokio::test]
async fn authenticates_and_receives_status_events() {
    let tor = fake_tor().await;
    let conn = TorControlConnection::new(&tor.port_file);
    let mut status = conn.add_status_observer();
    let mut circuit = conn.add_circuit_observer();

    conn.connect().await.unwrap();
    assert!(conn.is_connected());
    conn.authenticate(&[0x00, 0xff]).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), status.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.bootstrap_progress(), Some(50));
    assert_eq!(
        first.args.get("SUMMARY").map(String::as_str),
        Some("Loading relay descriptors")
    );

    let established = tokio::time::timeout(Duration::from_secs(5), circuit.events.recv())
        .await
        .unwrap();
    assert_eq!(established, Some(true));

    let commands = tor.commands.lock().unwrap().clone();
    assert_eq!(commands, vec!["AUTHENTICATE 00ff", "SETEVENTS STATUS_CLIENT"]);
}

#[tokio::test]
async fn bad_cookie_is_rejected() {
    let tor = fake_tor().await;
    let conn = TorControlConnection::new(&tor.port_file);
    conn.connect().await.unwrap();

    match conn.authenticate(&[0x12]).await {
        Err(ControlError::Rejected { code, .. }) => assert_eq!(code, 515),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn queries_listeners_and_circuits() {
    let tor = fake_tor().await;
    let conn = TorControlConnection::new(&tor.port_file);
    conn.connect().await.unwrap();

    let socks = conn.get_info(&["net/listeners/socks"]).await.unwrap();
    assert_eq!(socks, vec!["\"127.0.0.1:9150\"".to_string()]);

    let circuits = conn.get_circuits().await.unwrap();
    assert_eq!(circuits.len(), 2);
    assert_eq!(circuits[0].id, "1");
    assert_eq!(circuits[0].status, "BUILT");
    assert_eq!(circuits[0].path.len(), 2);
    assert_eq!(circuits[0].path[1].nickname.as_deref(), Some("beta"));
    assert!(circuits[0].time_created.is_some());
    assert_eq!(circuits[1].purpose.as_deref(), Some("HS_CLIENT_INTRO"));

    assert!(!conn.close_circuits(&circuits).await.unwrap());
    let commands = tor.commands.lock().unwrap().clone();
    assert!(commands.contains(&"CLOSECIRCUIT 1".to_string()));
    assert!(commands.contains(&"CLOSECIRCUIT 2".to_string()));
}

#[tokio::test]
async fn setconf_quotes_values_and_skips_empty() {
    let tor = fake_tor().await;
    let conn = TorControlConnection::new(&tor.port_file);
    conn.connect().await.unwrap();

    conn.set_confs(&[]).await.unwrap();
    conn.set_confs(&[
        ("UseBridges".to_string(), "1".to_string()),
        (
            "Bridge".to_string(),
            "obfs4 192.0.2.1:443 ABCD cert=x iat-mode=0".to_string(),
        ),
    ])
    .await
    .unwrap();
    conn.reset_conf("ClientTransportPlugin").await.unwrap();
    conn.reset_connection().await.unwrap();

    let commands = tor.commands.lock().unwrap().clone();
    assert_eq!(
        commands,
        vec![
            "SETCONF UseBridges=\"1\" Bridge=\"obfs4 192.0.2.1:443 ABCD cert=x iat-mode=0\"",
            "RESETCONF ClientTransportPlugin",
            "SIGNAL NEWNYM",
        ]
    );
}

#[tokio::test]
async fn garbled_reply_closes_the_session() {
    let tor = fake_tor().await;
    let conn = TorControlConnection::new(&tor.port_file);
    conn.connect().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), conn.get_info(&["garbled"]))
        .await
        .unwrap();
    assert!(matches!(result, Err(ControlError::Closed)));
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn disconnect_drops_the_session() {
    let tor = fake_tor().await;
    let conn = TorControlConnection::new(&tor.port_file);
    conn.connect().await.unwrap();

    conn.disconnect().await;
    assert!(!conn.is_connected());
    assert!(matches!(
        conn.get_info(&["version"]).await,
        Err(ControlError::NotConnected)
    ));
}
