//! Per-connection tasks: one reader that decodes frames and dispatches them
//! in arrival order, one writer that drains the session's outbound queue.

use crate::dispatcher::{Dispatcher, Flow};
use crate::session::{Outbound, SessionHandle};
use log::{debug, warn};
use shared::protocol::{encode_frame, FrameDecoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub const SERVER_FULL_REPLY: &str = "ERROR:server_full:too many connections";

/// How long the writer may keep flushing after the session is torn down.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Serves one accepted socket until either side closes it.
pub async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    max_frame_bytes: usize,
) {
    let admitted = dispatcher.sessions().write().await.add_session(peer);
    let Some((session, outbound)) = admitted else {
        warn!("Rejecting {}: server full", peer);
        let _ = stream.write_all(&encode_frame(SERVER_FULL_REPLY)).await;
        let _ = stream.shutdown().await;
        return;
    };

    let (reader, writer) = stream.into_split();
    let mut writer_task = tokio::spawn(run_writer(
        writer,
        outbound,
        Arc::clone(&session),
        Arc::clone(&dispatcher),
    ));

    let reason = run_reader(reader, &session, &dispatcher, max_frame_bytes).await;
    dispatcher.disconnect(&session, reason).await;
    // A peer that stopped reading can keep the writer parked in write_all.
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Session {} writer task failed: {}", session.id(), e),
        Err(_) => {
            debug!("Session {} writer did not drain, aborting", session.id());
            writer_task.abort();
        }
    }
}

/// Reads until EOF, error, a fatal frame, or a server-side close. Returns
/// the reason for the log.
async fn run_reader(
    mut reader: OwnedReadHalf,
    session: &SessionHandle,
    dispatcher: &Dispatcher,
    max_frame_bytes: usize,
) -> &'static str {
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if dispatcher.dispatch(session, &frame).await == Flow::Close {
                        return "too many violations";
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Session {} protocol error: {}", session.id(), e);
                    session.send(format!("ERROR:protocol_error:{e}"));
                    return "protocol error";
                }
            }
        }

        tokio::select! {
            read = reader.read_buf(decoder.buffer_mut()) => match read {
                Ok(0) => return "closed by peer",
                Ok(n) => debug!("Session {} read {} bytes", session.id(), n),
                Err(e) => {
                    debug!("Session {} read failed: {}", session.id(), e);
                    return "read error";
                }
            },
            _ = session.closed() => {
                return if session.is_overflowed() {
                    "outbound queue full"
                } else {
                    "closed by server"
                };
            }
        }
    }
}

/// Writes queued frames in order, one at a time.
async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    session: SessionHandle,
    dispatcher: Arc<Dispatcher>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(payload) => {
                if let Err(e) = writer.write_all(&encode_frame(&payload)).await {
                    debug!("Session {} write failed: {}", session.id(), e);
                    dispatcher.disconnect(&session, "write error").await;
                    break;
                }
                session.frame_written();
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}
