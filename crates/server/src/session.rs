//! Session loop: one reader thread per consumer connection.

use std::io::{BufReader, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use colex_common::{ColexError, ConnectionId, Result};
use colex_wire::{BatchResult, JobHeader, Message, OutputConnection, StreamConnection};
use tracing::{debug, info, warn};

use crate::service::BatchService;

/// Accept connections forever, serving each on its own thread.
pub fn serve(listener: TcpListener, service: Arc<BatchService>) -> Result<()> {
    let mut next_id = 1_u64;
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let id = ConnectionId(next_id);
        next_id += 1;
        let service = Arc::clone(&service);
        thread::Builder::new()
            .name(format!("colex-session-{}", id.0))
            .spawn(move || {
                if let Err(e) = serve_connection(&service, stream, id) {
                    warn!(connection = %id, error = %e, "session ended with error");
                }
            })
            .map_err(|e| ColexError::Execution(format!("failed to start session thread: {e}")))?;
    }
    Ok(())
}

pub fn serve_connection(service: &BatchService, stream: TcpStream, id: ConnectionId) -> Result<()> {
    let peer = stream.peer_addr().ok();
    stream.set_nodelay(true)?;
    let writer = stream.try_clone()?;
    let conn: Arc<dyn OutputConnection> = Arc::new(StreamConnection::new(id, writer));
    info!(connection = %id, ?peer, "session opened");
    let mut reader = BufReader::new(stream);
    let outcome = serve_stream(service, &mut reader, &conn);
    info!(connection = %id, "session closed");
    outcome
}

/// Handle messages from `reader` until a clean end of stream.
///
/// A message the service rejects is answered with a failed-batch result;
/// a frame that cannot be decoded ends the session.
pub fn serve_stream(
    service: &BatchService,
    reader: &mut impl Read,
    conn: &Arc<dyn OutputConnection>,
) -> Result<()> {
    while let Some(msg) = Message::read_from(reader)? {
        let command = msg.command();
        let header = header_of(&msg);
        debug!(connection = %conn.id(), ?command, "command received");
        let Err(err) = service.handle(msg, conn) else {
            continue;
        };
        warn!(connection = %conn.id(), ?command, error = %err, "command rejected");
        if let Some(header) = header {
            let report =
                Message::BatchResult(BatchResult::error(header, err.status_code(), err.to_string()));
            conn.write_frame(&report.encode()?)?;
        }
    }
    Ok(())
}

fn header_of(msg: &Message) -> Option<JobHeader> {
    match msg {
        Message::CreateBatch(create) => Some(create.job_header()),
        Message::RunBatch(run) => Some(run.header),
        Message::AddJoiner(build) => Some(build.header),
        Message::DestroyBatch(header) | Message::EndJoiner(header) | Message::Abort(header) => {
            Some(*header)
        }
        Message::FlowControl(fc) => Some(fc.header),
        Message::BatchResult(_) => None,
    }
}
