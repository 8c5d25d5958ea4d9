//! Per-connection tasks: a reader that reassembles and decodes PDUs, and a
//! writer that drains the connection's outbound queue.

use std::sync::Arc;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};

use super::{Master, MasterError};
use crate::{
    codec,
    pdu::{ErrorStatus, Payload, Pdu, PDU_HEADER_SIZE},
    session::PeerAddress,
};

const OUTBOUND_QUEUE: usize = 64;
const READ_CHUNK: usize = 4096;
/// Largest PDU accepted from a subagent.
const MAX_PDU_SIZE: usize = 1 << 20;
/// Consecutive undecodable PDUs after which the connection is dropped.
const MAX_PARSE_ERRORS: u32 = 3;

#[derive(Debug, PartialEq, Eq)]
enum PeerEnd {
    Eof,
    WriterClosed,
    ParseErrors,
}

pub(super) async fn serve_connection<S>(master: Arc<Master>, stream: S, address: PeerAddress)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let Some(connection_id) = master.attach_peer(address.clone(), outbound_tx) else {
        return;
    };
    let (reader, writer) = tokio::io::split(stream);
    let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx, connection_id));

    let end = read_loop(&master, reader, connection_id, &mut writer_task).await;
    match &end {
        Ok(end) => log::info!("Connection {} from {} ended: {:?}", connection_id, address, end),
        Err(e) => log::warn!("Connection {} from {} failed: {}", connection_id, address, e),
    }

    master.detach_peer(connection_id);
    if !matches!(end, Ok(PeerEnd::WriterClosed)) {
        if let Err(e) = writer_task.await {
            log::error!("Writer for connection {} panicked: {}", connection_id, e);
        }
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Pdu>, connection_id: u64)
where
    W: AsyncWrite + Unpin,
{
    while let Some(pdu) = outbound.recv().await {
        let bytes = codec::encode_pdu(&pdu);
        if let Err(e) = writer.write_all(&bytes).await {
            log::warn!("Write to connection {} failed: {}", connection_id, e);
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        log::debug!("Shutdown of connection {} failed: {}", connection_id, e);
    }
}

async fn read_loop<R>(
    master: &Master,
    mut reader: R,
    connection_id: u64,
    writer_task: &mut JoinHandle<()>,
) -> Result<PeerEnd, MasterError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut parse_errors = 0u32;

    loop {
        while buf.len() >= PDU_HEADER_SIZE {
            let frame_len = match codec::frame_length(&buf) {
                Ok(Some(len)) if len <= MAX_PDU_SIZE => len,
                Ok(Some(len)) => {
                    log::warn!("Connection {} announced a {} byte PDU", connection_id, len);
                    master.count_parse_error();
                    return Ok(PeerEnd::ParseErrors);
                }
                Ok(None) => break,
                Err(e) => {
                    // Without a readable header there is no way to resync.
                    log::warn!("Unreadable header on connection {}: {}", connection_id, e);
                    master.count_parse_error();
                    return Ok(PeerEnd::ParseErrors);
                }
            };
            if buf.len() < frame_len {
                break;
            }
            let frame: Vec<u8> = buf.drain(..frame_len).collect();

            match codec::decode_pdu(&frame) {
                Ok((pdu, _)) => {
                    parse_errors = 0;
                    master.dispatch_inbound(connection_id, pdu).await;
                }
                Err(e) => {
                    parse_errors += 1;
                    master.count_parse_error();
                    log::warn!("Undecodable PDU on connection {}: {}", connection_id, e);
                    if let Ok(header) = codec::decode_header(&frame) {
                        let response = Pdu {
                            session_id: header.session_id,
                            transaction_id: header.transaction_id,
                            packet_id: header.packet_id,
                            byte_order: header.byte_order(),
                            payload: Payload::Response {
                                sys_uptime: master.sys_uptime(),
                                error: ErrorStatus::ParseError,
                                index: 0,
                                varbinds: Vec::new(),
                            },
                        };
                        master.send(connection_id, response).await;
                    }
                    if parse_errors >= MAX_PARSE_ERRORS {
                        return Ok(PeerEnd::ParseErrors);
                    }
                }
            }
        }

        tokio::select! {
            read = reader.read(&mut chunk) => match read? {
                0 => return Ok(PeerEnd::Eof),
                n => buf.extend_from_slice(&chunk[..n]),
            },
            _ = &mut *writer_task => return Ok(PeerEnd::WriterClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::duplex;

    use super::*;
    use crate::{
        master::MasterConfig,
        oid::Oid,
        pdu::{ByteOrder, PduType},
    };

    async fn read_pdu<R: AsyncRead + Unpin>(reader: &mut R) -> Pdu {
        let mut header = [0u8; PDU_HEADER_SIZE];
        reader.read_exact(&mut header).await.unwrap();
        let total = codec::frame_length(&header).unwrap().unwrap();
        let mut frame = header.to_vec();
        frame.resize(total, 0);
        reader.read_exact(&mut frame[PDU_HEADER_SIZE..]).await.unwrap();
        codec::decode_pdu(&frame).unwrap().0
    }

    #[tokio::test]
    async fn test_open_over_stream_keeps_byte_order() {
        let master = Arc::new(Master::new(MasterConfig::default()));
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(serve_connection(
            master.clone(),
            server,
            PeerAddress::Local("/tmp/agentx-test".into()),
        ));

        let mut open = Pdu::new(
            0,
            0,
            7,
            Payload::Open {
                timeout: 5,
                id: Oid::from_slice(&[1, 3, 6, 1, 4, 1, 8072]),
                description: b"duplex".to_vec(),
            },
        );
        open.byte_order = ByteOrder::LittleEndian;
        client.write_all(&codec::encode_pdu(&open)).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), read_pdu(&mut client))
            .await
            .unwrap();
        assert_eq!(response.pdu_type(), PduType::Response);
        assert_eq!(response.packet_id, 7);
        assert_eq!(response.byte_order, ByteOrder::LittleEndian);
        assert_ne!(response.session_id, 0);
        assert_eq!(master.sessions().session_count(), 1);

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(master.sessions().session_count(), 0);
        assert_eq!(master.sessions().peer_count(), 0);
    }

    #[tokio::test]
    async fn test_writer_shuts_down_when_queue_closes() {
        let (mut client, server) = duplex(4096);
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(write_loop(server, rx, 9));

        tx.send(Pdu::new(3, 0, 1, Payload::Ping { context: None })).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), writer).await.unwrap().unwrap();

        assert_eq!(read_pdu(&mut client).await.pdu_type(), PduType::Ping);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_parse_errors_close_connection() {
        let master = Arc::new(Master::new(MasterConfig::default()));
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(serve_connection(
            master.clone(),
            server,
            PeerAddress::Local("/tmp/agentx-test".into()),
        ));

        // Valid header announcing a Close PDU whose reason byte is invalid.
        let mut bad = codec::encode_pdu(&Pdu::new(1, 2, 3, Payload::Close {
            reason: crate::pdu::CloseReason::Other,
        }));
        bad[PDU_HEADER_SIZE] = 0xee;
        for _ in 0..MAX_PARSE_ERRORS {
            client.write_all(&bad).await.unwrap();
        }
        for _ in 0..MAX_PARSE_ERRORS {
            let response = tokio::time::timeout(Duration::from_secs(2), read_pdu(&mut client))
                .await
                .unwrap();
            match response.payload {
                Payload::Response { error, .. } => assert_eq!(error, ErrorStatus::ParseError),
                other => panic!("unexpected {:?}", other),
            }
        }
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(master.status().counters.parse_errors, MAX_PARSE_ERRORS as u64);
    }
}
