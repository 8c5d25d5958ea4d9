//! Integration tests for master-subagent communication over loopback.
//!
//! These tests run a master on an ephemeral localhost port and drive it with
//! a minimal subagent speaking AgentX over TCP.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use agentx_master::codec::{decode_pdu, encode_pdu, frame_length};
use agentx_master::master::{Listeners, Master, MasterConfig, MasterError};
use agentx_master::oid::Oid;
use agentx_master::pdu::*;
use agentx_master::transaction::{ManagementRequest, RequestKind};

const ENTERPRISE: &[u32] = &[1, 3, 6, 1, 4, 1, 99999];

/// Starts a master on an ephemeral port.
async fn start_master() -> (
    Arc<Master>,
    std::net::SocketAddr,
    oneshot::Sender<()>,
    JoinHandle<Result<(), MasterError>>,
) {
    let config = MasterConfig {
        tcp_addr: Some("127.0.0.1:0".parse().unwrap()),
        default_timeout: Duration::from_secs(2),
        ..MasterConfig::default()
    };
    let master = Arc::new(Master::new(config));
    let listeners = Listeners::bind(master.config()).await.unwrap();
    let addr = listeners.tcp_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(master.clone().serve(listeners, async move {
        let _ = stop_rx.await;
    }));
    (master, addr, stop_tx, handle)
}

async fn write_pdu(stream: &mut TcpStream, pdu: &Pdu) -> Result<(), &'static str> {
    stream
        .write_all(&encode_pdu(pdu))
        .await
        .map_err(|_| "Failed to send PDU")
}

async fn read_pdu(stream: &mut TcpStream) -> Result<Pdu, &'static str> {
    let mut header = [0u8; PDU_HEADER_SIZE];
    timeout(Duration::from_secs(5), stream.read_exact(&mut header))
        .await
        .map_err(|_| "Timeout waiting for PDU")?
        .map_err(|_| "Receive error")?;
    let total = frame_length(&header)
        .map_err(|_| "Bad header")?
        .ok_or("Short header")?;
    let mut frame = header.to_vec();
    frame.resize(total, 0);
    stream
        .read_exact(&mut frame[PDU_HEADER_SIZE..])
        .await
        .map_err(|_| "Receive error")?;
    decode_pdu(&frame).map(|(pdu, _)| pdu).map_err(|_| "Failed to decode PDU")
}

fn response_status(pdu: &Pdu) -> ErrorStatus {
    match &pdu.payload {
        Payload::Response { error, .. } => *error,
        _ => ErrorStatus::GenErr,
    }
}

/// Connects, opens a session and registers the enterprise subtree.
async fn connect_subagent(addr: std::net::SocketAddr, byte_order: ByteOrder) -> (TcpStream, u32) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut open = Pdu::new(
        0,
        0,
        1,
        Payload::Open {
            timeout: 0,
            id: Oid::from_slice(ENTERPRISE),
            description: b"loopback subagent".to_vec(),
        },
    );
    open.byte_order = byte_order;
    write_pdu(&mut stream, &open).await.unwrap();
    let response = read_pdu(&mut stream).await.unwrap();
    assert_eq!(response_status(&response), ErrorStatus::NoError);
    let session_id = response.session_id;

    let mut register = Pdu::new(
        session_id,
        0,
        2,
        Payload::Register {
            context: None,
            timeout: 0,
            priority: DEFAULT_PRIORITY,
            range_subid: 0,
            subtree: Oid::from_slice(ENTERPRISE),
            upper_bound: None,
            instance: false,
        },
    );
    register.byte_order = byte_order;
    write_pdu(&mut stream, &register).await.unwrap();
    let response = read_pdu(&mut stream).await.unwrap();
    assert_eq!(response_status(&response), ErrorStatus::NoError);

    (stream, session_id)
}

/// Answers master requests until Close; returns the PDU types it saw.
async fn run_test_subagent(mut stream: TcpStream) -> Result<Vec<PduType>, &'static str> {
    let mut seen = Vec::new();
    loop {
        let pdu = read_pdu(&mut stream).await?;
        seen.push(pdu.pdu_type());
        let varbinds = match &pdu.payload {
            Payload::Get { ranges, .. } => ranges
                .iter()
                .map(|r| VarBind::new(r.start.clone(), VarBindValue::Integer(42)))
                .collect(),
            Payload::TestSet { .. } | Payload::CommitSet | Payload::UndoSet => Vec::new(),
            Payload::CleanupSet => continue,
            Payload::Close { .. } => return Ok(seen),
            _ => return Err("Unexpected PDU"),
        };
        let response = pdu.response(0, ErrorStatus::NoError, 0, varbinds);
        write_pdu(&mut stream, &response).await?;
    }
}

#[tokio::test]
async fn test_loopback_get_and_set() {
    let (master, addr, stop, handle) = start_master().await;
    let (stream, session_id) = connect_subagent(addr, ByteOrder::LittleEndian).await;
    assert_eq!(master.sessions().session_count(), 1);
    assert_eq!(master.registry().len(), 1);

    let subagent = tokio::spawn(run_test_subagent(stream));

    let mut instance = ENTERPRISE.to_vec();
    instance.extend_from_slice(&[1, 0]);
    let instance = Oid(instance);

    let get = ManagementRequest::read(RequestKind::Get, &[instance.clone()]);
    let response = master.process(&get).await;
    assert_eq!(response.error_status, ErrorStatus::NoError);
    assert_eq!(response.varbinds[0], VarBind::new(instance.clone(), VarBindValue::Integer(42)));

    let set = ManagementRequest::new(
        RequestKind::Set,
        vec![VarBind::new(instance.clone(), VarBindValue::Integer(7))],
    );
    let response = master.process(&set).await;
    assert_eq!(response.error_status, ErrorStatus::NoError);

    // Stopping the master closes the session with reason shutdown.
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let seen = subagent.await.unwrap().unwrap();
    assert_eq!(
        seen,
        vec![
            PduType::Get,
            PduType::TestSet,
            PduType::CommitSet,
            PduType::CleanupSet,
            PduType::Close
        ]
    );
    assert!(master.sessions().session(session_id).is_none());
    assert!(master.registry().is_empty());
}

#[tokio::test]
async fn test_loopback_disconnect_releases_registrations() {
    let (master, addr, stop, handle) = start_master().await;
    let (stream, _) = connect_subagent(addr, ByteOrder::BigEndian).await;
    assert_eq!(master.registry().len(), 1);

    drop(stream);

    let mut released = false;
    for _ in 0..50 {
        if master.registry().is_empty() && master.sessions().peer_count() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "Registrations not released after disconnect");

    let mut instance = ENTERPRISE.to_vec();
    instance.extend_from_slice(&[1, 0]);
    let get = ManagementRequest::read(RequestKind::Get, &[Oid(instance)]);
    let response = master.process(&get).await;
    assert_eq!(response.varbinds[0].value, VarBindValue::NoSuchObject);

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_loopback_close_by_subagent() {
    let (master, addr, stop, handle) = start_master().await;
    let (mut stream, session_id) = connect_subagent(addr, ByteOrder::BigEndian).await;

    let close = Pdu::new(
        session_id,
        0,
        3,
        Payload::Close {
            reason: CloseReason::Shutdown,
        },
    );
    write_pdu(&mut stream, &close).await.unwrap();
    let response = read_pdu(&mut stream).await.unwrap();
    assert_eq!(response_status(&response), ErrorStatus::NoError);
    assert!(master.registry().is_empty());

    // The connection stays usable for a new session.
    let ping = Pdu::new(session_id, 0, 4, Payload::Ping { context: None });
    write_pdu(&mut stream, &ping).await.unwrap();
    let response = read_pdu(&mut stream).await.unwrap();
    assert_eq!(response_status(&response), ErrorStatus::NotOpen);

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
