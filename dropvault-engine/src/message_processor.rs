use tracing::{debug, info, warn};

use dropvault_core::Result;
use dropvault_core::protocol::{Command, ErrorCode, Frame, MessageType, Response, parse_request};
use dropvault_core::storage::Storage;
use dropvault_core::transport::Connection;

use crate::framed::Framed;
use crate::handlers::{download, list, upload};
use crate::session::SessionConfig;

/// Processes a fully decoded frame by dispatching the request it carries
/// to the matching handler.
///
/// Malformed requests are answered with an error response and the session
/// carries on. Returns `Err(..)` only when the session should be torn
/// down (socket failure, timeout, or a payload stream left out of sync).
///
/// # Errors
///
/// Propagates fatal handler errors.
pub async fn process_frame<C: Connection>(
    storage: &Storage,
    config: &SessionConfig,
    framed: &mut Framed<C>,
    frame: Frame,
) -> Result<()> {
    let peer = framed.peer().to_owned();
    debug!(
        peer = %peer,
        msg_type = ?frame.header.msg_type,
        payload_len = frame.header.payload_length,
        "Processing frame"
    );

    if frame.header.msg_type != MessageType::Request {
        warn!(
            peer = %peer,
            msg_type = ?frame.header.msg_type,
            "Unexpected frame, expected a request"
        );
        let response = Response::error(
            ErrorCode::Protocol,
            format!("Unexpected {:?} frame, expected a request", frame.header.msg_type),
        );
        return framed.send_response(&response).await;
    }

    let command = match parse_request(&frame.payload) {
        Ok(command) => command,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejected request");
            return framed.send_response(&Response::from_error(&e)).await;
        }
    };

    info!(peer = %peer, command = command.name(), "Received command");
    match command {
        Command::Upload(request) => upload::handle_upload(storage, config, framed, request).await,
        Command::Download(request) => {
            download::handle_download(storage, config, framed, request).await
        }
        Command::List => list::handle_list(storage, framed).await,
    }
}
