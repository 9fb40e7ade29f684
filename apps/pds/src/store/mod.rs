//! Persistence of accounts, keys and operations.
//!
//! Each kind of record has its own store trait, so that deployments can mix
//! backends (for example operations in SQLite, keys on disk). Backends are
//! picked by URI scheme through a [`Registry`].

pub mod blob;
pub mod null;
pub mod registry;
pub mod sql;

pub use self::registry::{Registries, Registry, StoreUris};

use std::{
	collections::HashMap,
	fmt::Debug,
	sync::Arc,
	time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use did_plc::{codec::EncodeError, Cid, DidKey, DidPlc, Handle, SignedOperation};
use did_simple::crypto::secp256k1::{FromMultibaseError, SigningKey};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A stream of records, as returned by the `list` methods.
pub type RecordStream<'a, T> = BoxStream<'a, Result<T, StoreError>>;

/// Seconds since the unix epoch.
pub fn now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or_default()
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Account {
	pub did: DidPlc,
	pub handle: Handle,
	pub created: i64,
	pub last_modified: i64,
}

impl Account {
	pub fn new(did: DidPlc, handle: Handle) -> Self {
		let now = now();
		Self {
			did,
			handle,
			created: now,
			last_modified: now,
		}
	}
}

/// A private key at rest, encoded as multibase.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, derive_more::Debug)]
pub struct KeyRecord {
	pub did: DidPlc,
	pub label: String,
	pub public_key: DidKey,
	#[debug(skip)]
	pub private_key: String,
	pub created: i64,
	pub last_modified: i64,
}

impl KeyRecord {
	pub fn new(did: DidPlc, label: &str, key: &SigningKey) -> Self {
		let now = now();
		Self {
			did,
			label: label.to_owned(),
			public_key: DidKey::from(&key.verifying_key()),
			private_key: key.to_multibase(),
			created: now,
			last_modified: now,
		}
	}

	pub fn signing_key(&self) -> Result<SigningKey, FromMultibaseError> {
		SigningKey::from_multibase(&self.private_key)
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct OperationRecord {
	pub cid: Cid,
	pub did: DidPlc,
	pub operation: SignedOperation,
	pub created: i64,
	pub last_modified: i64,
}

impl OperationRecord {
	pub fn new(did: DidPlc, operation: SignedOperation) -> Result<Self, EncodeError> {
		let now = now();
		Ok(Self {
			cid: operation.cid()?,
			did,
			operation,
			created: now,
			last_modified: now,
		})
	}
}

#[async_trait]
pub trait AccountsStore: Debug + Send + Sync + 'static {
	async fn get(&self, did: &DidPlc) -> Result<Option<Account>, StoreError>;
	async fn get_by_handle(&self, handle: &Handle) -> Result<Option<Account>, StoreError>;
	/// Inserts or replaces the account. Fails with [`StoreError::Conflict`] if
	/// another account already holds the handle.
	async fn put(&self, account: &Account) -> Result<(), StoreError>;
	/// Deleting a missing account is not an error.
	async fn delete(&self, did: &DidPlc) -> Result<(), StoreError>;
	fn list(&self) -> RecordStream<'_, Account>;
}

#[async_trait]
pub trait KeysStore: Debug + Send + Sync + 'static {
	async fn get(&self, did: &DidPlc, label: &str) -> Result<Option<KeyRecord>, StoreError>;
	async fn put(&self, key: &KeyRecord) -> Result<(), StoreError>;
	async fn delete(&self, did: &DidPlc, label: &str) -> Result<(), StoreError>;
	/// Removes every key of `did`.
	async fn delete_for_did(&self, did: &DidPlc) -> Result<(), StoreError>;
	fn list(&self) -> RecordStream<'_, KeyRecord>;
}

#[async_trait]
pub trait OperationsStore: Debug + Send + Sync + 'static {
	async fn get(&self, cid: &Cid) -> Result<Option<OperationRecord>, StoreError>;
	/// The most recent operation of `did`.
	async fn head(&self, did: &DidPlc) -> Result<Option<OperationRecord>, StoreError>;
	/// Every operation of `did`, oldest first.
	async fn list_for_did(&self, did: &DidPlc) -> Result<Vec<OperationRecord>, StoreError>;
	/// Appends `record` only if the current head of its DID is
	/// `expected_head`, otherwise fails with [`StoreError::HeadMismatch`].
	async fn append(
		&self,
		record: &OperationRecord,
		expected_head: Option<&Cid>,
	) -> Result<(), StoreError>;
	/// Erases every local operation of `did`.
	async fn purge(&self, did: &DidPlc) -> Result<(), StoreError>;
	fn list(&self) -> RecordStream<'_, OperationRecord>;
}

/// One handle to each kind of store.
#[derive(Debug, Clone)]
pub struct Stores {
	pub accounts: Arc<dyn AccountsStore>,
	pub keys: Arc<dyn KeysStore>,
	pub operations: Arc<dyn OperationsStore>,
}

impl Stores {
	/// Stores that live in process memory and vanish on drop.
	pub fn in_memory() -> Self {
		let bucket: Arc<dyn blob::Bucket> = Arc::new(blob::MemoryBucket::default());
		Self {
			accounts: Arc::new(blob::BlobAccountsStore::new(Arc::clone(&bucket))),
			keys: Arc::new(blob::BlobKeysStore::new(Arc::clone(&bucket))),
			operations: Arc::new(blob::BlobOperationsStore::new(bucket)),
		}
	}

	/// Stores that keep nothing.
	pub fn null() -> Self {
		Self {
			accounts: Arc::new(null::NullStore),
			keys: Arc::new(null::NullStore),
			operations: Arc::new(null::NullStore),
		}
	}
}

/// Orders the operations of a single DID along their `prev` links, oldest
/// first.
pub fn order_chain(records: Vec<OperationRecord>) -> Result<Vec<OperationRecord>, StoreError> {
	let total = records.len();
	let mut by_prev: HashMap<Option<Cid>, OperationRecord> = HashMap::with_capacity(total);
	for record in records {
		let prev = record.operation.op.prev().cloned();
		if let Some(other) = by_prev.insert(prev, record) {
			return Err(StoreError::Corrupt(format!(
				"operations of {} fork at {}",
				other.did, other.cid
			)));
		}
	}
	let mut ordered = Vec::with_capacity(total);
	let mut next = by_prev.remove(&None);
	while let Some(record) = next {
		next = by_prev.remove(&Some(record.cid.clone()));
		ordered.push(record);
	}
	if let Some(detached) = by_prev.into_values().next() {
		return Err(StoreError::Corrupt(format!(
			"operation {} of {} is not linked to the genesis operation",
			detached.cid, detached.did
		)));
	}
	Ok(ordered)
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("database error")]
	Sql(#[from] sqlx::Error),
	#[error("failed to migrate database")]
	Migrate(#[from] sqlx::migrate::MigrateError),
	#[error("i/o error")]
	Io(#[from] std::io::Error),
	#[error("failed to (de)serialize record")]
	Json(#[from] serde_json::Error),
	#[error("corrupt record: {0}")]
	Corrupt(String),
	#[error("{0} already exists")]
	Conflict(String),
	#[error("head of {did} is {found:?} but {expected:?} was expected")]
	HeadMismatch {
		did: DidPlc,
		expected: Option<Cid>,
		found: Option<Cid>,
	},
	#[error("invalid store uri {uri:?}: {reason}")]
	InvalidUri { uri: String, reason: String },
	#[error("no store backend is registered for scheme {0:?}")]
	UnknownScheme(String),
	#[error("a store backend is already registered for scheme {0:?}")]
	DuplicateScheme(String),
	#[error("store task was interrupted: {0}")]
	Interrupted(String),
}

#[cfg(test)]
mod test {
	use super::*;

	use did_plc::{derive_did, UnsignedOperation};

	#[test]
	fn test_key_record_debug_is_redacted() -> eyre::Result<()> {
		let key = SigningKey::generate()?;
		let genesis = UnsignedOperation::genesis(
			"alice",
			"https://pds.example",
			DidKey::from(&key.verifying_key()),
		)?
		.sign(&key)?;
		let record = KeyRecord::new(derive_did(&genesis)?, "atproto", &key);
		let debug = format!("{record:?}");
		assert!(!debug.contains(&record.private_key));
		assert!(debug.contains(record.public_key.as_str()));
		assert_eq!(record.signing_key()?.to_bytes(), key.to_bytes());
		Ok(())
	}

	#[test]
	fn test_order_chain() -> eyre::Result<()> {
		let key = SigningKey::generate()?;
		let genesis = UnsignedOperation::genesis(
			"alice",
			"https://pds.example",
			DidKey::from(&key.verifying_key()),
		)?
		.sign(&key)?;
		let did = derive_did(&genesis)?;
		let regular = genesis.op.as_regular().expect("regular");
		let update = UnsignedOperation::update_handle(regular, genesis.cid()?, "bob")?.sign(&key)?;
		let tombstone = UnsignedOperation::tombstone(update.cid()?).sign(&key)?;

		let records = [&tombstone, &genesis, &update]
			.into_iter()
			.map(|op| OperationRecord::new(did.clone(), op.clone()))
			.collect::<Result<Vec<_>, _>>()?;
		let ordered = order_chain(records)?;
		let ops: Vec<_> = ordered.iter().map(|r| &r.operation).collect();
		assert_eq!(ops, [&genesis, &update, &tombstone]);

		let detached = vec![OperationRecord::new(did, update)?];
		assert!(matches!(order_chain(detached), Err(StoreError::Corrupt(_))));
		Ok(())
	}
}
