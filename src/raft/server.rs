use super::node::{self, Shared};
use super::Message;
use crate::encoding;
use crate::error::Result;

use ::log::{debug, error};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

/// The peer-facing server task: accepts inbound connections and serves each
/// on its own thread until the stream closes or the node shuts down. This
/// is the RPC worker for the two inbound consensus handlers; the
/// client-facing surface of the containing process is elsewhere.
pub(super) fn serve(shared: Arc<Shared>, listener: TcpListener) -> Result<()> {
    for stream in listener.incoming() {
        if shared.is_exiting() {
            break;
        }
        match stream {
            Ok(stream) => {
                let shared = shared.clone();
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".into());
                let name = format!("fjord-conn-{peer}");
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        debug!("peer {peer} connected");
                        match session(&shared, stream) {
                            Ok(()) => debug!("peer {peer} disconnected"),
                            Err(err) if err.is_fatal() => node::fatal(err),
                            Err(err) => debug!("peer {peer} error: {err}"),
                        }
                    })
                    .expect("failed to spawn connection thread");
            }
            Err(err) => error!("accept failed: {err}"),
        }
    }
    Ok(())
}

/// Serves one inbound connection: decode an envelope, dispatch to the
/// matching handler, reply in-stream. Malformed input from the network
/// closes the connection; only handler (i.e. durability) errors propagate.
fn session(shared: &Shared, mut stream: TcpStream) -> Result<()> {
    loop {
        if shared.is_exiting() {
            return Ok(());
        }
        let message = match encoding::maybe_deserialize_from(&mut stream) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!("dropping connection: {err}");
                return Ok(());
            }
        };
        let reply = match message {
            Message::RequestVote(req) => Message::RequestVoteReply(shared.request_vote(&req)?),
            Message::AppendEntries(req) => {
                Message::AppendEntriesReply(shared.append_entries(&req)?)
            }
            message => {
                debug!("unexpected request: {message:?}");
                return Ok(());
            }
        };
        if let Err(err) = encoding::serialize_into(&mut stream, &reply) {
            debug!("dropping connection: {err}");
            return Ok(());
        }
    }
}
