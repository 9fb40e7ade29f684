use did_plc::{Cid, DidPlc, Handle, InvalidHandle, OperationKind};
use did_simple::crypto::secp256k1::KeyGenerationError;

use crate::{directory::DirectoryError, store::StoreError};

/// What an error is about. Before the genesis operation is signed there is no
/// DID yet, only a handle.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Display)]
pub enum Subject {
	#[display("{_0}")]
	Did(DidPlc),
	#[display("handle {_0}")]
	Handle(String),
}

impl From<DidPlc> for Subject {
	fn from(value: DidPlc) -> Self {
		Self::Did(value)
	}
}

impl From<&DidPlc> for Subject {
	fn from(value: &DidPlc) -> Self {
		Self::Did(value.clone())
	}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum RecordKind {
	#[display("account")]
	Account,
	#[display("key")]
	Key,
	#[display("operation")]
	Operation,
}

/// Errors of the account lifecycle. Every variant names what it is about, so
/// it can be logged as is.
#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
	#[error(transparent)]
	InvalidHandle(#[from] InvalidHandle),
	#[error("handle {0} is already taken")]
	HandleTaken(Handle),
	#[error("handle {handle} of {did} is held by {holder} in the local stores")]
	HandleConflict {
		did: DidPlc,
		handle: Handle,
		holder: DidPlc,
	},
	#[error("no {kind} found for {did}")]
	NotFound { did: DidPlc, kind: RecordKind },
	#[error("failed to generate a key for {subject}")]
	KeyGeneration {
		subject: Subject,
		#[source]
		source: KeyGenerationError,
	},
	#[error("{op} operation for {subject} failed")]
	Operation {
		subject: Subject,
		op: OperationKind,
		#[source]
		source: did_plc::Error,
	},
	#[error("the directory did not accept the {op} operation for {did}")]
	DirectorySubmissionFailed {
		did: DidPlc,
		op: OperationKind,
		#[source]
		source: DirectoryError,
	},
	#[error("failed to read {did} from the directory")]
	Directory {
		did: DidPlc,
		#[source]
		source: DirectoryError,
	},
	#[error(
		"the directory accepted {op} operation {cid} for {did} but it was not \
		persisted locally, reconcile {did} instead of retrying"
	)]
	ReconciliationRequired {
		did: DidPlc,
		op: OperationKind,
		cid: Cid,
		#[source]
		source: StoreError,
	},
	#[error("{op} operation for {did} was cancelled before submission")]
	Cancelled { did: DidPlc, op: OperationKind },
	#[error(
		"{op} operation for {did} was cancelled during submission, reconcile \
		{did} before retrying"
	)]
	SubmissionInterrupted { did: DidPlc, op: OperationKind },
	#[error("local operation {cid} of {did} is not part of the directory log")]
	Diverged { did: DidPlc, cid: Cid },
	#[error("store failed while handling {subject}")]
	Store {
		subject: Subject,
		#[source]
		source: StoreError,
	},
}

impl LifecycleError {
	pub(crate) fn operation(
		subject: impl Into<Subject>,
		op: OperationKind,
		source: impl Into<did_plc::Error>,
	) -> Self {
		Self::Operation {
			subject: subject.into(),
			op,
			source: source.into(),
		}
	}

	pub(crate) fn store(subject: impl Into<Subject>) -> impl FnOnce(StoreError) -> Self {
		let subject = subject.into();
		move |source| Self::Store { subject, source }
	}

	/// Whether the caller may try again.
	///
	/// Transient directory failures can be retried as is. A stale operation or
	/// a lost race on the store head means another operation won: the caller
	/// must rebuild against the fresh head rather than resubmit. Everything
	/// else (cryptography, encoding, tombstones, remote rejections) is
	/// terminal.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::DirectorySubmissionFailed { source, .. }
			| Self::Directory { source, .. } => source.is_transient(),
			Self::Operation {
				source: did_plc::Error::Chain(err),
				..
			} => err.is_conflict(),
			Self::Store {
				source: StoreError::HeadMismatch { .. },
				..
			} => true,
			Self::Cancelled { .. } => true,
			_ => false,
		}
	}
}
