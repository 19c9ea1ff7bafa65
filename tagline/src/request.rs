//! Unary request/response batches and result compilation.

use crate::buffer::ByteBuffer;
use crate::error::Error;
use crate::metadata::MetadataMap;
use crate::native::ClientStatus;
use crate::op::{Op, OpResult};
use crate::status::StatusCode;

/// Outcome of a unary call that finished with `OK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalRequestResult {
    /// Response payload; `None` when the server sent no message.
    pub body: Option<ByteBuffer>,
    /// Server initial metadata. Absent on the registered path, which does not
    /// receive it.
    pub initial_metadata: Option<MetadataMap>,
    pub trailing_metadata: MetadataMap,
    pub status: StatusCode,
    pub details: String,
}

/// Which receive ops a unary request asked for, and so which results it
/// expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `[RecvInitialMetadata, RecvMessage, RecvStatusOnClient]`
    WithInitialMetadata,
    /// `[RecvMessage, RecvStatusOnClient]`
    WithoutInitialMetadata,
}

/// The client's send batch: metadata, one message, half-close.
pub fn send_ops(body: ByteBuffer, metadata: MetadataMap) -> Vec<Op> {
    vec![
        Op::SendInitialMetadata(metadata),
        Op::SendMessage(body),
        Op::SendCloseFromClient,
    ]
}

impl ResponseShape {
    /// The client's receive batch for this shape.
    pub fn receive_ops(self) -> Vec<Op> {
        match self {
            ResponseShape::WithInitialMetadata => {
                vec![Op::RecvInitialMetadata, Op::RecvMessage, Op::RecvStatusOnClient]
            }
            ResponseShape::WithoutInitialMetadata => vec![Op::RecvMessage, Op::RecvStatusOnClient],
        }
    }

    /// Compile decoded receive results into a [`NormalRequestResult`].
    ///
    /// A non-OK status wins over everything else and yields
    /// [`Error::BadStatusCode`]. Results that do not match the shape yield
    /// [`Error::Unknown`].
    pub fn compile(self, results: Vec<OpResult>) -> Result<NormalRequestResult, Error> {
        if let Some(OpResult::StatusOnClient(status)) =
            results.iter().find(|r| matches!(r, OpResult::StatusOnClient(_)))
        {
            if !status.status.is_ok() {
                return Err(Error::BadStatusCode {
                    status: status.status,
                    details: status.details.clone(),
                });
            }
        }

        let count = results.len();
        let (initial_metadata, body, status) = match self {
            ResponseShape::WithInitialMetadata => match <[OpResult; 3]>::try_from(results) {
                Ok([
                    OpResult::InitialMetadata(md),
                    OpResult::Message(body),
                    OpResult::StatusOnClient(status),
                ]) => (Some(md), body, status),
                _ => return Err(shape_mismatch(self, count)),
            },
            ResponseShape::WithoutInitialMetadata => match <[OpResult; 2]>::try_from(results) {
                Ok([OpResult::Message(body), OpResult::StatusOnClient(status)]) => {
                    (None, body, status)
                }
                _ => return Err(shape_mismatch(self, count)),
            },
        };

        let ClientStatus {
            trailing_metadata,
            status,
            details,
        } = status;
        Ok(NormalRequestResult {
            body,
            initial_metadata,
            trailing_metadata,
            status,
            details,
        })
    }
}

fn shape_mismatch(shape: ResponseShape, count: usize) -> Error {
    tracing::warn!(?shape, count, "unexpected batch result shape");
    Error::Unknown(format!("{count} results do not match {shape:?}"))
}
