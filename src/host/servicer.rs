//! Per-connection RPC servicer thread.
//!
//! Waits for requests, absolutizes the arena, dispatches, relativizes,
//! posts the response, and loops until the overlay dies or the host
//! shuts down. Whichever wait first observes the peer gone runs the
//! connection-scoped cleanup exactly once.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ResultCode;
use crate::transport::ServeWait;

use super::{dispatch, Connection, HostShared};

pub(crate) fn run(conn: Arc<Connection>, shared: Arc<HostShared>) {
    let _span = tracing::info_span!("servicer", pid = conn.pid).entered();
    info!("servicing overlay connection");

    loop {
        match conn.channel.wait_request_or_stop(&conn.closed) {
            ServeWait::Request => {
                // Safety: the request semaphore hands this side the
                // arena until the response is posted.
                let mut arena = unsafe { conn.channel.arena() };
                match arena.absolutize() {
                    Ok(()) => dispatch::dispatch(&shared, &conn, &mut arena),
                    Err(e) => {
                        warn!(error = %e, "request arena failed validation");
                        arena.set_result(ResultCode::RuntimeFailure);
                    }
                }
                arena.relativize();
                if conn.channel.post_response().is_err() {
                    break;
                }
            }
            ServeWait::PeerGone => {
                debug!("overlay process terminated");
                break;
            }
            ServeWait::Stopped => {
                debug!("servicer stopped by host");
                break;
            }
            ServeWait::Failed(e) => {
                warn!(error = %e, "servicer wait failed");
                break;
            }
        }
    }

    shared.cleanup_connection(&conn);
}
