//! Demo message routes.

use std::sync::{Arc, OnceLock, Weak};

use tidewire_core::MsgId;
use tidewire_server::{Request, Router, Server, handler_fn};
use tracing::{debug, warn};

/// Reply with the same payload.
pub const ECHO: MsgId = 1;
/// Relay the payload to every connected client as [`BROADCAST`].
pub const BROADCAST: MsgId = 2;
/// Answered with [`PONG`] carrying the same payload.
pub const PING: MsgId = 3;
/// Reply to [`PING`].
pub const PONG: MsgId = 4;

/// Late-bound server handle for handlers that act on every connection.
///
/// Routes are built before the server exists; fill this once it does.
pub type ServerSlot = Arc<OnceLock<Weak<Server>>>;

/// The demo route table.
pub fn demo_router(slot: &ServerSlot) -> Router {
    let mut router = Router::new();
    let slot = Arc::clone(slot);

    let _ = router
        .add_route(
            ECHO,
            handler_fn(|req: Request| async move {
                if let Err(e) = req.conn().send_msg(ECHO, req.data()).await {
                    debug!(conn_id = req.conn().id(), error = %e, "echo reply dropped");
                }
            }),
        )
        .add_route(
            PING,
            handler_fn(|req: Request| async move {
                if let Err(e) = req.conn().send_msg(PONG, req.data()).await {
                    debug!(conn_id = req.conn().id(), error = %e, "pong dropped");
                }
            }),
        )
        .add_route(
            BROADCAST,
            handler_fn(move |req: Request| {
                let server = slot.get().and_then(Weak::upgrade);
                async move {
                    let Some(server) = server else {
                        warn!("broadcast before server was bound");
                        return;
                    };
                    let delivered = server.broadcast(BROADCAST, req.data());
                    debug!(from = req.conn().id(), delivered, "relayed broadcast");
                }
            }),
        );
    router
}
