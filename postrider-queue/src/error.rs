//! Queue-level failures and their mapping onto SMTP replies.

use postrider_common::Reply;
use postrider_policy::PolicyReject;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// A pre-queue policy refused the envelope.
    #[error(transparent)]
    Rejected(#[from] PolicyReject),

    #[error("envelope has no recipients")]
    NoRecipients,

    #[error("queue is shutting down")]
    ShuttingDown,
}

impl QueueError {
    /// The reply an edge should send for this failure: policy
    /// rejections speak for themselves, everything else is a transient
    /// `451`.
    #[must_use]
    pub fn reply(&self) -> Reply {
        match self {
            Self::Rejected(reject) => reject.reply.clone(),
            Self::Storage(_) | Self::NoRecipients => {
                Reply::new(451, "4.3.0 Error queuing message")
            }
            Self::ShuttingDown => Reply::new(451, "4.3.2 Queue shutting down"),
        }
    }
}
