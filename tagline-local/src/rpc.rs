//! Shared state of one in-process RPC and batch progression.
//!
//! Both ends of a call hold the same [`Rpc`]. Send ops are applied the moment
//! a batch is submitted; receive ops wait in the submitting side's pending list
//! until the state can satisfy them, and the batch's tag is posted once every
//! receive op of the batch is done.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tagline::native::{CallError, ClientStatus, EventQueue, OpKind, RawOp};
use tagline::{ByteBuffer, Deadline, MetadataMap, StatusCode, Tag};

use crate::alarm::Expire;

/// Which end of the call a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

struct PendingBatch {
    ops: Vec<RawOp>,
    done: Vec<bool>,
    tag: Tag,
    queue: Arc<EventQueue>,
}

#[derive(Default)]
struct SideState {
    /// Once-per-call op kinds already submitted.
    invoked: HashSet<OpKind>,
    pending: Vec<PendingBatch>,
}

#[derive(Default)]
struct RpcState {
    client_metadata: Option<MetadataMap>,
    requests: VecDeque<ByteBuffer>,
    half_closed: bool,
    server_metadata: Option<MetadataMap>,
    responses: VecDeque<ByteBuffer>,
    /// Set once; the call is finished from then on.
    status: Option<ClientStatus>,
    /// Finished by cancellation or deadline rather than a server status.
    cancelled: bool,
    client: SideState,
    server: SideState,
}

fn once_per_call(kind: OpKind) -> bool {
    kind != OpKind::SendMessage && kind != OpKind::RecvMessage
}

pub(crate) struct Rpc {
    method: String,
    host: String,
    deadline: Deadline,
    state: Mutex<RpcState>,
}

impl Rpc {
    pub(crate) fn new(method: &str, host: &str, deadline: Deadline) -> Arc<Self> {
        Arc::new(Self {
            method: method.to_string(),
            host: host.to_string(),
            deadline,
            state: Mutex::new(RpcState::default()),
        })
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Initial metadata the client sent, empty until the call is invoked.
    pub(crate) fn client_metadata(&self) -> MetadataMap {
        self.state.lock().client_metadata.clone().unwrap_or_default()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().status.is_some()
    }

    /// Validate and apply a batch from `side`.
    ///
    /// Returns `true` if the batch invoked the call (client initial metadata),
    /// in which case the caller must route it to a server.
    pub(crate) fn start_batch(
        &self,
        side: Side,
        ops: &[RawOp],
        tag: Tag,
        queue: &Arc<EventQueue>,
    ) -> Result<bool, CallError> {
        if queue.is_shutdown() {
            return Err(CallError::CompletionQueueShutdown);
        }
        validate(side, ops)?;

        let mut state = self.state.lock();
        let sent = state.side_mut(side);
        if ops
            .iter()
            .any(|op| once_per_call(op.kind()) && sent.invoked.contains(&op.kind()))
        {
            return Err(CallError::AlreadyInvoked);
        }
        sent.invoked
            .extend(ops.iter().map(RawOp::kind).filter(|k| once_per_call(*k)));

        if state.status.is_some() && ops.iter().any(|op| op.kind().is_send()) {
            tracing::debug!(%tag, method = %self.method, ?side, "send on finished call");
            queue.post(tag, false);
            return Ok(false);
        }

        let mut invoke = false;
        for op in ops {
            match (side, op) {
                (Side::Client, RawOp::SendInitialMetadata(md)) => {
                    state.client_metadata = Some(md.clone());
                    invoke = true;
                }
                (Side::Client, RawOp::SendMessage(msg)) => state.requests.push_back(msg.clone()),
                (Side::Client, RawOp::SendCloseFromClient) => state.half_closed = true,
                (Side::Server, RawOp::SendInitialMetadata(md)) => {
                    state.server_metadata = Some(md.clone());
                }
                (Side::Server, RawOp::SendMessage(msg)) => state.responses.push_back(msg.clone()),
                (
                    Side::Server,
                    RawOp::SendStatusFromServer {
                        trailing_metadata,
                        status,
                        details,
                    },
                ) => {
                    state.status = Some(ClientStatus {
                        trailing_metadata: trailing_metadata.clone(),
                        status: *status,
                        details: details.clone(),
                    });
                }
                _ => {}
            }
        }

        state.side_mut(side).pending.push(PendingBatch {
            done: ops.iter().map(|op| op.kind().is_send()).collect(),
            ops: ops.to_vec(),
            tag,
            queue: queue.clone(),
        });
        state.progress();
        Ok(invoke)
    }

    /// Finish the call with `status` unless it already has one. Pending
    /// receives complete. Returns whether this call set the status.
    pub(crate) fn finish(&self, status: StatusCode, details: &str, cancelled: bool) -> bool {
        let mut state = self.state.lock();
        if state.status.is_some() {
            return false;
        }
        tracing::debug!(method = %self.method, %status, details, "call finished");
        state.status = Some(ClientStatus {
            trailing_metadata: MetadataMap::new(),
            status,
            details: details.to_string(),
        });
        state.cancelled = cancelled;
        state.progress();
        true
    }
}

impl Expire for Rpc {
    fn expire(&self) {
        if self.finish(StatusCode::DeadlineExceeded, "Deadline Exceeded", true) {
            tracing::debug!(method = %self.method, "deadline exceeded");
        }
    }
}

impl RpcState {
    fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Advance every pending batch on both sides, posting those that are done.
    fn progress(&mut self) {
        for side in [Side::Server, Side::Client] {
            let mut pending = std::mem::take(&mut self.side_mut(side).pending);
            pending.retain_mut(|batch| !self.advance(side, batch));
            self.side_mut(side).pending = pending;
        }
    }

    fn advance(&mut self, side: Side, batch: &mut PendingBatch) -> bool {
        for (op, done) in batch.ops.iter().zip(batch.done.iter_mut()) {
            if !*done {
                *done = self.try_fill(side, op);
            }
        }
        if batch.done.iter().all(|d| *d) {
            tracing::trace!(tag = %batch.tag, ?side, "batch complete");
            batch.queue.post(batch.tag, true);
            return true;
        }
        false
    }

    fn try_fill(&mut self, side: Side, op: &RawOp) -> bool {
        let finished = self.status.is_some();
        match op {
            RawOp::RecvInitialMetadata(slot) => match &self.server_metadata {
                Some(md) => {
                    slot.fill(md.clone());
                    true
                }
                None if finished => {
                    slot.fill(MetadataMap::new());
                    true
                }
                None => false,
            },
            RawOp::RecvMessage(slot) => {
                let inbound = match side {
                    Side::Client => &mut self.responses,
                    Side::Server => &mut self.requests,
                };
                match inbound.pop_front() {
                    Some(msg) => {
                        slot.fill(msg);
                        true
                    }
                    None => finished || (side == Side::Server && self.half_closed),
                }
            }
            RawOp::RecvStatusOnClient(slot) => match &self.status {
                Some(status) => {
                    slot.fill(status.clone());
                    true
                }
                None => false,
            },
            RawOp::RecvCloseOnServer(slot) => {
                if self.cancelled {
                    slot.fill(true);
                    true
                } else if self.half_closed || finished {
                    slot.fill(false);
                    true
                } else {
                    false
                }
            }
            RawOp::SendInitialMetadata(_)
            | RawOp::SendMessage(_)
            | RawOp::SendCloseFromClient
            | RawOp::SendStatusFromServer { .. } => true,
        }
    }
}

/// Checks that need no call state: op side, duplicates within the batch and
/// metadata keys.
fn validate(side: Side, ops: &[RawOp]) -> Result<(), CallError> {
    let mut kinds = HashSet::with_capacity(ops.len());
    for op in ops {
        let kind = op.kind();
        match side {
            Side::Client if !kind.valid_on_client() => return Err(CallError::NotOnClient),
            Side::Server if !kind.valid_on_server() => return Err(CallError::NotOnServer),
            _ => {}
        }
        if !kinds.insert(kind) {
            return Err(CallError::TooManyOperations);
        }
        let metadata = match op {
            RawOp::SendInitialMetadata(md) => Some(md),
            RawOp::SendStatusFromServer {
                trailing_metadata, ..
            } => Some(trailing_metadata),
            _ => None,
        };
        if let Some(Err(key)) = metadata.map(MetadataMap::validate) {
            tracing::debug!(key, "invalid metadata key");
            return Err(CallError::InvalidMetadata);
        }
    }
    Ok(())
}
