//! Typed batch operations and their native encoding.
//!
//! [`OpContext::encode`] turns a list of [`Op`]s into the raw array handed to
//! the engine, allocating one output slot per receive op. After the batch
//! completes, [`OpContext::decode`] moves each filled value out into an
//! [`OpResult`] and releases the slot. Slots not decoded are released when the
//! context drops, so every exit path frees each slot exactly once.

use crate::buffer::ByteBuffer;
use crate::metadata::MetadataMap;
use crate::metrics;
use crate::native::{ClientStatus, OpKind, OutputSlot, RawOp};
use crate::status::StatusCode;

/// A batch operation as requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    SendInitialMetadata(MetadataMap),
    SendMessage(ByteBuffer),
    SendCloseFromClient,
    SendStatusFromServer {
        trailing_metadata: MetadataMap,
        status: StatusCode,
        details: String,
    },
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
    RecvCloseOnServer,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::SendInitialMetadata(_) => OpKind::SendInitialMetadata,
            Op::SendMessage(_) => OpKind::SendMessage,
            Op::SendCloseFromClient => OpKind::SendCloseFromClient,
            Op::SendStatusFromServer { .. } => OpKind::SendStatusFromServer,
            Op::RecvInitialMetadata => OpKind::RecvInitialMetadata,
            Op::RecvMessage => OpKind::RecvMessage,
            Op::RecvStatusOnClient => OpKind::RecvStatusOnClient,
            Op::RecvCloseOnServer => OpKind::RecvCloseOnServer,
        }
    }
}

/// Decoded value of one receive op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    InitialMetadata(MetadataMap),
    /// `None` when the peer sent no message.
    Message(Option<ByteBuffer>),
    StatusOnClient(ClientStatus),
    CloseOnServer { cancelled: bool },
}

impl OpResult {
    pub fn kind(&self) -> OpKind {
        match self {
            OpResult::InitialMetadata(_) => OpKind::RecvInitialMetadata,
            OpResult::Message(_) => OpKind::RecvMessage,
            OpResult::StatusOnClient(_) => OpKind::RecvStatusOnClient,
            OpResult::CloseOnServer { .. } => OpKind::RecvCloseOnServer,
        }
    }
}

/// Native-facing form of one batch and owner of its output slots.
#[derive(Debug)]
pub struct OpContext {
    ops: Vec<RawOp>,
    /// Per op: whether its output slot still needs releasing.
    live: Vec<bool>,
}

impl OpContext {
    /// Encode `ops` in order, allocating an output slot for each receive op.
    pub fn encode(ops: Vec<Op>) -> Self {
        let mut raw = Vec::with_capacity(ops.len());
        let mut live = Vec::with_capacity(ops.len());
        for op in ops {
            let receive = !op.kind().is_send();
            raw.push(match op {
                Op::SendInitialMetadata(md) => RawOp::SendInitialMetadata(md),
                Op::SendMessage(buf) => RawOp::SendMessage(buf),
                Op::SendCloseFromClient => RawOp::SendCloseFromClient,
                Op::SendStatusFromServer {
                    trailing_metadata,
                    status,
                    details,
                } => RawOp::SendStatusFromServer {
                    trailing_metadata,
                    status,
                    details,
                },
                Op::RecvInitialMetadata => RawOp::RecvInitialMetadata(OutputSlot::new()),
                Op::RecvMessage => RawOp::RecvMessage(OutputSlot::new()),
                Op::RecvStatusOnClient => RawOp::RecvStatusOnClient(OutputSlot::new()),
                Op::RecvCloseOnServer => RawOp::RecvCloseOnServer(OutputSlot::new()),
            });
            if receive {
                metrics::SLOTS_ALLOCATED.increment();
            }
            live.push(receive);
        }
        Self { ops: raw, live }
    }

    /// The raw batch to submit.
    pub fn raw_ops(&self) -> &[RawOp] {
        &self.ops
    }

    pub fn kinds(&self) -> impl Iterator<Item = OpKind> + '_ {
        self.ops.iter().map(RawOp::kind)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Output slots not yet released.
    pub fn live_slots(&self) -> usize {
        self.live.iter().filter(|l| **l).count()
    }

    /// Copy every filled output out and release its slot.
    ///
    /// Send ops produce no result. Slots released by an earlier decode are
    /// skipped, so a second call returns only what the first did not.
    pub fn decode(&mut self) -> Vec<OpResult> {
        let mut results = Vec::new();
        for (op, live) in self.ops.iter().zip(self.live.iter_mut()) {
            if !*live {
                continue;
            }
            *live = false;
            metrics::SLOTS_RELEASED.increment();
            results.push(match op {
                RawOp::RecvInitialMetadata(slot) => {
                    OpResult::InitialMetadata(slot.take().unwrap_or_default())
                }
                RawOp::RecvMessage(slot) => OpResult::Message(slot.take()),
                RawOp::RecvStatusOnClient(slot) => {
                    OpResult::StatusOnClient(slot.take().unwrap_or_else(|| ClientStatus {
                        trailing_metadata: MetadataMap::new(),
                        status: StatusCode::Unknown,
                        details: "status not delivered".to_string(),
                    }))
                }
                RawOp::RecvCloseOnServer(slot) => OpResult::CloseOnServer {
                    cancelled: slot.take().unwrap_or(true),
                },
                RawOp::SendInitialMetadata(_)
                | RawOp::SendMessage(_)
                | RawOp::SendCloseFromClient
                | RawOp::SendStatusFromServer { .. } => continue,
            });
        }
        results
    }

    fn release(&mut self) {
        for (op, live) in self.ops.iter().zip(self.live.iter_mut()) {
            if !*live {
                continue;
            }
            *live = false;
            metrics::SLOTS_RELEASED.increment();
            match op {
                RawOp::RecvInitialMetadata(slot) => drop(slot.take()),
                RawOp::RecvMessage(slot) => drop(slot.take()),
                RawOp::RecvStatusOnClient(slot) => drop(slot.take()),
                RawOp::RecvCloseOnServer(slot) => drop(slot.take()),
                _ => {}
            }
        }
    }
}

impl Drop for OpContext {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> MetadataMap {
        [("hello", "world"), ("foo", "bar")].into_iter().collect()
    }

    #[test]
    fn encode_preserves_order() {
        let ctx = OpContext::encode(vec![
            Op::SendInitialMetadata(metadata()),
            Op::SendMessage(ByteBuffer::copy_in(b"hello world")),
            Op::SendCloseFromClient,
            Op::RecvInitialMetadata,
            Op::RecvMessage,
            Op::RecvStatusOnClient,
        ]);
        let kinds: Vec<OpKind> = ctx.kinds().collect();
        assert_eq!(
            kinds,
            [
                OpKind::SendInitialMetadata,
                OpKind::SendMessage,
                OpKind::SendCloseFromClient,
                OpKind::RecvInitialMetadata,
                OpKind::RecvMessage,
                OpKind::RecvStatusOnClient,
            ]
        );
        assert_eq!(ctx.len(), 6);
        assert_eq!(ctx.live_slots(), 3);
    }

    /// Stand in for the engine: fill every receive slot.
    fn fill(ctx: &OpContext) {
        for op in ctx.raw_ops() {
            match op {
                RawOp::RecvInitialMetadata(slot) => slot.fill(metadata()),
                RawOp::RecvMessage(slot) => slot.fill(ByteBuffer::copy_in(b"hello you")),
                RawOp::RecvStatusOnClient(slot) => slot.fill(ClientStatus {
                    trailing_metadata: MetadataMap::new(),
                    status: StatusCode::Ok,
                    details: String::new(),
                }),
                RawOp::RecvCloseOnServer(slot) => slot.fill(false),
                _ => {}
            }
        }
    }

    #[test]
    fn decode_filled_slots() {
        let mut ctx = OpContext::encode(vec![
            Op::RecvInitialMetadata,
            Op::RecvMessage,
            Op::RecvStatusOnClient,
        ]);
        fill(&ctx);
        let results = ctx.decode();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], OpResult::InitialMetadata(metadata()));
        assert_eq!(results[1], OpResult::Message(Some(ByteBuffer::copy_in(b"hello you"))));
        match &results[2] {
            OpResult::StatusOnClient(s) => assert_eq!(s.status, StatusCode::Ok),
            other => panic!("expected status, got {other:?}"),
        }
        assert_eq!(ctx.live_slots(), 0);
    }

    #[test]
    fn decoded_metadata_keeps_insertion_order() {
        let mut ctx = OpContext::encode(vec![Op::RecvInitialMetadata]);
        fill(&ctx);
        match ctx.decode().pop() {
            Some(OpResult::InitialMetadata(md)) => {
                let pairs: Vec<(&str, &[u8])> = md.iter().collect();
                assert_eq!(pairs, [("hello", &b"world"[..]), ("foo", &b"bar"[..])]);
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn unfilled_message_is_no_payload() {
        let mut ctx = OpContext::encode(vec![Op::RecvMessage]);
        assert_eq!(ctx.decode(), [OpResult::Message(None)]);
    }

    #[test]
    fn unfilled_status_and_close_still_decode() {
        let mut ctx = OpContext::encode(vec![Op::RecvStatusOnClient, Op::RecvCloseOnServer]);
        let results = ctx.decode();
        match &results[0] {
            OpResult::StatusOnClient(s) => assert_eq!(s.status, StatusCode::Unknown),
            other => panic!("expected status, got {other:?}"),
        }
        assert_eq!(results[1], OpResult::CloseOnServer { cancelled: true });
    }

    #[test]
    fn decode_releases_exactly_once() {
        let mut ctx = OpContext::encode(vec![Op::SendCloseFromClient, Op::RecvMessage]);
        fill(&ctx);
        let engine_view = match &ctx.raw_ops()[1] {
            RawOp::RecvMessage(slot) => slot.clone(),
            other => panic!("unexpected op {other:?}"),
        };
        assert_eq!(ctx.decode().len(), 1);
        assert!(!engine_view.is_filled());
        assert!(ctx.decode().is_empty());
    }

    #[test]
    fn drop_releases_undecoded_slots() {
        let ctx = OpContext::encode(vec![Op::RecvMessage]);
        fill(&ctx);
        let engine_view = match &ctx.raw_ops()[0] {
            RawOp::RecvMessage(slot) => slot.clone(),
            other => panic!("unexpected op {other:?}"),
        };
        assert!(engine_view.is_filled());
        drop(ctx);
        assert!(!engine_view.is_filled());
    }

    #[test]
    fn send_only_batch_decodes_to_nothing() {
        let mut ctx = OpContext::encode(vec![
            Op::SendMessage(ByteBuffer::copy_in(b"x")),
            Op::SendCloseFromClient,
        ]);
        assert_eq!(ctx.live_slots(), 0);
        assert!(ctx.decode().is_empty());
    }
}
