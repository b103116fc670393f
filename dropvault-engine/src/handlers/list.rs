use tracing::{debug, warn};

use dropvault_core::Result;
use dropvault_core::protocol::Response;
use dropvault_core::storage::Storage;
use dropvault_core::transport::Connection;

use crate::framed::Framed;

/// Handles a `LIST` request: every active file with its archived versions.
///
/// # Errors
///
/// Returns an error when the response cannot be sent.
pub async fn handle_list<C: Connection>(storage: &Storage, framed: &mut Framed<C>) -> Result<()> {
    match storage.list().await {
        Ok(files) => {
            debug!(peer = %framed.peer(), count = files.len(), "Listing files");
            framed.send_response(&Response::listing(files)).await
        }
        Err(e) => {
            warn!(peer = %framed.peer(), error = %e, "Failed to list storage");
            framed.send_response(&Response::from_error(&e)).await
        }
    }
}
