//! Per-cycle heartbeat emitter.
//!
//! When enabled, each watcher cycle opens with one `ae='h'` record carrying
//! the current UTC and local wall times, so the collector can tell a quiet
//! log directory from a dead agent. The heartbeat `_ts` keeps its full
//! fractional seconds, unlike data records.

use crate::clock::Clock;
use crate::pipeline::record::{self, SourceIds};
use crate::transport::{Transport, TransportError};

/// Build and ship one heartbeat frame.
pub async fn emit(
    transport: &mut Transport,
    ids: &SourceIds,
    clock: &Clock,
) -> Result<(), TransportError> {
    let frame = record::build_heartbeat(ids, clock);
    transport.send(frame.json.into_bytes()).await
}
