//! Validation of an identifier's operation log.
//!
//! [`ChainValidator`] is a small state machine per identifier:
//!
//! ```text
//! Unborn --genesis--> Active --update--> Active --tombstone--> Tombstoned
//! ```
//!
//! Every operation after genesis must name the CID of the current head in
//! `prev` and be signed by one of the head's rotation keys. The `prev` check
//! doubles as the race detector: two operations built against the same head
//! cannot both be accepted.

use did_simple::methods::plc::DidPlc;
use tracing::debug;

use crate::{
	codec::EncodeError,
	derive::{derive_did, DeriveError},
	operation::{OperationKind, SignedOperation, UnsignedOperation},
	Cid, DidKey,
};

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum ChainState {
	/// No operation accepted yet.
	#[default]
	Unborn,
	Active {
		head: Cid,
		/// Rotation keys of the head, which may sign the next operation.
		rotation_keys: Vec<DidKey>,
	},
	/// Terminal.
	Tombstoned { head: Cid },
}

impl ChainState {
	pub fn head(&self) -> Option<&Cid> {
		match self {
			Self::Unborn => None,
			Self::Active { head, .. } | Self::Tombstoned { head } => Some(head),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ChainValidator {
	did: DidPlc,
	state: ChainState,
}

impl ChainValidator {
	pub fn new(did: DidPlc) -> Self {
		Self {
			did,
			state: ChainState::Unborn,
		}
	}

	/// Replays a whole log, oldest operation first.
	pub fn from_log<'a>(
		did: DidPlc,
		log: impl IntoIterator<Item = &'a SignedOperation>,
	) -> Result<Self, ChainError> {
		let mut validator = Self::new(did);
		for op in log {
			validator.apply(op)?;
		}
		Ok(validator)
	}

	pub fn did(&self) -> &DidPlc {
		&self.did
	}

	pub fn state(&self) -> &ChainState {
		&self.state
	}

	pub fn head(&self) -> Option<&Cid> {
		self.state.head()
	}

	pub fn is_tombstoned(&self) -> bool {
		matches!(self.state, ChainState::Tombstoned { .. })
	}

	/// Checks whether `op` would be accepted as the next operation, without
	/// changing any state. Returns the CID `op` would have.
	pub fn check(&self, op: &SignedOperation) -> Result<Cid, ChainError> {
		let kind = op.kind();
		let (expected, rotation_keys) = match &self.state {
			ChainState::Tombstoned { .. } => {
				return Err(ChainError::IdentifierTombstoned {
					did: self.did.clone(),
				})
			}
			ChainState::Unborn => {
				if op.op.prev().is_some() {
					return Err(self.stale(None, op));
				}
				let UnsignedOperation::Regular(genesis) = &op.op else {
					return Err(ChainError::NotGenesisOperation {
						did: self.did.clone(),
						kind,
					});
				};
				let derived = derive_did(op).map_err(|err| match err {
					DeriveError::Encode(err) => ChainError::Encoding(err),
					DeriveError::NotGenesisOperation(kind) => {
						ChainError::NotGenesisOperation {
							did: self.did.clone(),
							kind,
						}
					}
				})?;
				if derived != self.did {
					return Err(ChainError::DidMismatch {
						claimed: self.did.clone(),
						derived,
					});
				}
				(None, genesis.rotation_keys.as_slice())
			}
			ChainState::Active {
				head,
				rotation_keys,
			} => (Some(head), rotation_keys.as_slice()),
		};

		if op.op.prev() != expected {
			return Err(self.stale(expected.cloned(), op));
		}
		if let UnsignedOperation::Regular(regular) = &op.op {
			if regular.rotation_keys.is_empty() {
				return Err(ChainError::NoRotationKeys {
					did: self.did.clone(),
				});
			}
		}
		op.verify_with_any(rotation_keys)
			.map_err(|_| ChainError::VerificationFailed {
				did: self.did.clone(),
				kind,
			})?;
		Ok(op.cid()?)
	}

	/// Accepts `op` as the new head. On error the state is unchanged.
	pub fn apply(&mut self, op: &SignedOperation) -> Result<Cid, ChainError> {
		let cid = self.check(op)?;
		self.state = match &op.op {
			UnsignedOperation::Regular(regular) => ChainState::Active {
				head: cid.clone(),
				rotation_keys: regular.rotation_keys.clone(),
			},
			UnsignedOperation::Tombstone(_) => {
				ChainState::Tombstoned { head: cid.clone() }
			}
		};
		debug!(did = %self.did, %cid, kind = %op.kind(), "accepted operation");
		Ok(cid)
	}

	fn stale(&self, expected: Option<Cid>, op: &SignedOperation) -> ChainError {
		ChainError::StaleOperation {
			did: self.did.clone(),
			expected,
			found: op.op.prev().cloned(),
		}
	}
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum ChainError {
	#[error("{did} is tombstoned and accepts no further operations")]
	IdentifierTombstoned { did: DidPlc },
	#[error(
		"stale operation for {did}: prev is {found:?} but the current head is {expected:?}"
	)]
	StaleOperation {
		did: DidPlc,
		expected: Option<Cid>,
		found: Option<Cid>,
	},
	#[error("the first operation of {did} must be a genesis operation, got {kind}")]
	NotGenesisOperation { did: DidPlc, kind: OperationKind },
	#[error("genesis operation derives {derived}, not {claimed}")]
	DidMismatch { claimed: DidPlc, derived: DidPlc },
	#[error("{kind} operation for {did} is not signed by an authorized rotation key")]
	VerificationFailed { did: DidPlc, kind: OperationKind },
	#[error("operation for {did} has no rotation keys")]
	NoRotationKeys { did: DidPlc },
	#[error(transparent)]
	Encoding(#[from] EncodeError),
}

impl ChainError {
	/// Stale operations can be rebuilt against a fresh head. Nothing else
	/// will ever succeed on retry.
	pub fn is_conflict(&self) -> bool {
		matches!(self, Self::StaleOperation { .. })
	}
}
