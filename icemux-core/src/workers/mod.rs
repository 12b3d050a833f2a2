//! Worker pool hand-off
//!
//! The accept loop never performs client I/O; it enqueues each accepted
//! client here. The default pool gives every client its own tokio task,
//! which drives the state machine cooperatively: run a step, sleep until
//! the step's next-wake timestamp, repeat. A client is owned by exactly one
//! task, so it is never entered re-entrantly.

use std::sync::Arc;

use log::debug;
use tokio::time::{sleep, Duration};

use crate::client::{Client, Step};
use crate::server::ServerContext;

/// The worker pool the accept loop hands clients to.
pub trait WorkerPool: Send + Sync {
    fn enqueue(&self, client: Client, ctx: Arc<ServerContext>);
}

/// One tokio task per client on the shared runtime.
pub struct TokioWorkers;

impl WorkerPool for TokioWorkers {
    fn enqueue(&self, client: Client, ctx: Arc<ServerContext>) {
        tokio::spawn(drive(client, ctx));
    }
}

/// Drive a client's step loop until a terminal handler takes it or it
/// closes.
pub async fn drive(mut client: Client, ctx: Arc<ServerContext>) {
    loop {
        let now = ctx.now_ms();
        if client.schedule_ms > now {
            sleep(Duration::from_millis(client.schedule_ms - now)).await;
        }
        match client.step(&ctx) {
            Step::Wake(next) => client = next,
            Step::Consumed => return,
            Step::Closed(client) => {
                debug!(
                    "connection {} from {} closed",
                    client.connection.id, client.connection.ip
                );
                ctx.unregister_client();
                return;
            }
        }
    }
}
