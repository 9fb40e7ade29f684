//! Creating, renaming and deleting self-custodial identities.
//!
//! Every change follows the same steps. Build the operation from local state,
//! sign it, submit it to the directory and persist it only once the directory
//! has accepted it. Changes to the same DID, and claims on the same handle, are
//! serialized. Submission and persistence run together in their own task, so
//! dropping the caller's future cannot leave the directory ahead of the
//! stores. Only the [`CancellationToken`] interrupts a submission.

use std::{
	collections::HashMap,
	future::Future,
	hash::Hash,
	sync::{Arc, Mutex, PoisonError, Weak},
};

use did_plc::{
	derive_did, document::DidDocument, operation::ATPROTO_KEY, ChainError,
	ChainValidator, Cid, DidKey, DidPlc, Handle, OperationKind, SignedOperation,
	UnsignedOperation,
};
use did_simple::crypto::secp256k1::SigningKey;
use futures::TryStreamExt as _;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument as _, Span};

use crate::{
	directory::Directory,
	error::{LifecycleError, RecordKind, Subject},
	store::{now, Account, KeyRecord, OperationRecord, StoreError, Stores},
};

/// Label of the key that signs every operation.
pub const KEY_LABEL: &str = ATPROTO_KEY;

#[derive(Debug, Clone)]
pub struct CreatedAccount {
	pub account: Account,
	pub key: KeyRecord,
	pub genesis: OperationRecord,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct DeleteOptions {
	/// Also erase the local copy of the operation log. The directory keeps
	/// its copy regardless.
	pub erase_operations: bool,
}

#[derive(Debug, Clone)]
pub struct DeletedAccount {
	pub did: DidPlc,
	pub tombstone: OperationRecord,
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
	pub did: DidPlc,
	/// Operations that were missing locally, oldest first.
	pub appended: Vec<Cid>,
	pub tombstoned: bool,
	pub account: Option<Account>,
}

/// One lock per key. Entries go away once nobody holds or waits for them.
///
/// Locks are always taken DID first, then handle.
#[derive(Debug)]
struct Locks<K>(Mutex<HashMap<K, Weak<tokio::sync::Mutex<()>>>>);

impl<K> Default for Locks<K> {
	fn default() -> Self {
		Self(Mutex::new(HashMap::new()))
	}
}

impl<K: Eq + Hash + Clone> Locks<K> {
	async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
		let lock = {
			let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
			locks.retain(|_, lock| lock.strong_count() > 0);
			match locks.get(key).and_then(Weak::upgrade) {
				Some(lock) => lock,
				None => {
					let lock = Arc::new(tokio::sync::Mutex::new(()));
					locks.insert(key.clone(), Arc::downgrade(&lock));
					lock
				}
			}
		};
		lock.lock_owned().await
	}
}

/// Manages the identities whose keys this server holds.
#[derive(Debug, Clone)]
pub struct IdentityManager {
	directory: Arc<dyn Directory>,
	stores: Stores,
	dids: Arc<Locks<DidPlc>>,
	handles: Arc<Locks<Handle>>,
}

impl IdentityManager {
	pub fn new(directory: Arc<dyn Directory>, stores: Stores) -> Self {
		Self {
			directory,
			stores,
			dids: Arc::default(),
			handles: Arc::default(),
		}
	}

	pub fn directory(&self) -> &Arc<dyn Directory> {
		&self.directory
	}

	pub fn stores(&self) -> &Stores {
		&self.stores
	}

	/// Creates a new identity for `handle`, hosted at `service_endpoint`.
	///
	/// Nothing is stored unless the directory accepts the genesis operation.
	/// The handle stays locked from the uniqueness check until the stores are
	/// written. The key is written first, then the genesis operation, then the
	/// account: if a later write fails the handle still reads as free, and
	/// [`Self::reconcile`] recreates the account from the stored key.
	#[instrument(skip(self, cancel), fields(did = tracing::field::Empty))]
	pub async fn create_account(
		&self,
		handle: &str,
		service_endpoint: &str,
		cancel: &CancellationToken,
	) -> Result<CreatedAccount, LifecycleError> {
		let handle = Handle::parse(handle)?;
		let subject = Subject::Handle(handle.to_string());
		let key = SigningKey::generate().map_err(|source| LifecycleError::KeyGeneration {
			subject: subject.clone(),
			source,
		})?;
		let genesis = sign_genesis(&handle, service_endpoint, &key)
			.map_err(|err| LifecycleError::operation(subject, OperationKind::Genesis, err))?;
		let did = derive_did(&genesis).map_err(|err| {
			LifecycleError::operation(
				Subject::Handle(handle.to_string()),
				OperationKind::Genesis,
				err,
			)
		})?;
		Span::current().record("did", tracing::field::display(&did));

		let did_guard = self.dids.acquire(&did).await;
		let handle_guard = self.handles.acquire(&handle).await;
		let taken = self
			.stores
			.accounts
			.get_by_handle(&handle)
			.await
			.map_err(LifecycleError::store(&did))?;
		if taken.is_some() {
			return Err(LifecycleError::HandleTaken(handle));
		}

		let record = self.record(&did, genesis)?;
		let account = Account::new(did.clone(), handle);
		let key = KeyRecord::new(did, KEY_LABEL, &key);
		let stores = self.stores.clone();
		let (account_, key_, record_) = (account.clone(), key.clone(), record.clone());
		let held = (did_guard, handle_guard);
		self.commit(&record, held, cancel, async move {
			stores.keys.put(&key_).await?;
			stores.operations.append(&record_, None).await?;
			stores.accounts.put(&account_).await
		})
		.await?;
		info!(handle = %account.handle, cid = %record.cid, "created account");
		Ok(CreatedAccount {
			account,
			key,
			genesis: record,
		})
	}

	/// Points `did` at a new handle.
	#[instrument(skip(self, cancel), fields(%did))]
	pub async fn update_handle(
		&self,
		did: &DidPlc,
		handle: &str,
		cancel: &CancellationToken,
	) -> Result<Account, LifecycleError> {
		let handle = Handle::parse(handle)?;
		let did_guard = self.dids.acquire(did).await;
		let account = self.account(did).await?;
		if account.handle == handle {
			debug!("handle is unchanged");
			return Ok(account);
		}
		let handle_guard = self.handles.acquire(&handle).await;
		let holder = self
			.stores
			.accounts
			.get_by_handle(&handle)
			.await
			.map_err(LifecycleError::store(did))?;
		if holder.is_some_and(|holder| holder.did != *did) {
			return Err(LifecycleError::HandleTaken(handle));
		}

		let key = self.signing_key(did).await?;
		let head = self.head(did).await?;
		let op = match &head.operation.op {
			UnsignedOperation::Regular(regular) => {
				UnsignedOperation::update_handle(regular, head.cid.clone(), handle.as_str())
					.map_err(|err| {
						LifecycleError::operation(did, OperationKind::Update, err)
					})?
			}
			UnsignedOperation::Tombstone(_) => {
				return Err(tombstoned(did, OperationKind::Update));
			}
		};
		let op = op
			.sign(&key)
			.map_err(|err| LifecycleError::operation(did, OperationKind::Update, err))?;
		let record = self.record(did, op)?;

		let previous = account.handle.clone();
		let updated = Account {
			handle,
			last_modified: now(),
			..account
		};
		let stores = self.stores.clone();
		let (updated_, record_, head_cid) = (updated.clone(), record.clone(), head.cid);
		let held = (did_guard, handle_guard);
		self.commit(&record, held, cancel, async move {
			stores.operations.append(&record_, Some(&head_cid)).await?;
			stores.accounts.put(&updated_).await
		})
		.await?;
		info!(%previous, handle = %updated.handle, cid = %record.cid, "updated handle");
		Ok(updated)
	}

	/// Tombstones `did` and forgets its account and keys.
	///
	/// The tombstone is committed locally before the keys are destroyed, so a
	/// failure part way through leaves something [`Self::reconcile`] can
	/// finish.
	#[instrument(skip(self, cancel), fields(%did))]
	pub async fn delete_account(
		&self,
		did: &DidPlc,
		options: DeleteOptions,
		cancel: &CancellationToken,
	) -> Result<DeletedAccount, LifecycleError> {
		let guard = self.dids.acquire(did).await;
		self.account(did).await?;
		let key = self.signing_key(did).await?;
		let head = self.head(did).await?;
		if let UnsignedOperation::Tombstone(_) = head.operation.op {
			return Err(tombstoned(did, OperationKind::Tombstone));
		}
		let op = UnsignedOperation::tombstone(head.cid.clone())
			.sign(&key)
			.map_err(|err| LifecycleError::operation(did, OperationKind::Tombstone, err))?;
		let record = self.record(did, op)?;

		let stores = self.stores.clone();
		let (did_, record_, head_cid) = (did.clone(), record.clone(), head.cid);
		self.commit(&record, guard, cancel, async move {
			stores.operations.append(&record_, Some(&head_cid)).await?;
			stores.keys.delete_for_did(&did_).await?;
			stores.accounts.delete(&did_).await?;
			if options.erase_operations {
				stores.operations.purge(&did_).await?;
			}
			Ok::<_, StoreError>(())
		})
		.await?;
		info!(
			cid = %record.cid,
			erased_operations = options.erase_operations,
			"deleted account"
		);
		Ok(DeletedAccount {
			did: did.clone(),
			tombstone: record,
		})
	}

	/// Brings the local stores in line with the directory's log of `did`.
	///
	/// Missing operations are appended, the account follows the latest
	/// handle, and a tombstoned DID loses its account and keys. Fails if the
	/// local log is not a prefix of the directory's, or if the latest handle
	/// belongs to another local account.
	#[instrument(skip(self), fields(%did))]
	pub async fn reconcile(&self, did: &DidPlc) -> Result<ReconcileReport, LifecycleError> {
		let _guard = self.dids.acquire(did).await;
		let log = self
			.directory
			.op_log(did)
			.await
			.map_err(|source| LifecycleError::Directory {
				did: did.clone(),
				source,
			})?;
		let mut validator = ChainValidator::new(did.clone());
		let mut remote = Vec::with_capacity(log.len());
		for op in log {
			let kind = op.kind();
			validator
				.apply(&op)
				.map_err(|err| LifecycleError::operation(did, kind, err))?;
			remote.push(self.record(did, op)?);
		}

		let local = self
			.stores
			.operations
			.list_for_did(did)
			.await
			.map_err(LifecycleError::store(did))?;
		for (i, record) in local.iter().enumerate() {
			if remote.get(i).map(|r| &r.cid) != Some(&record.cid) {
				warn!(cid = %record.cid, "local log diverges from the directory");
				return Err(LifecycleError::Diverged {
					did: did.clone(),
					cid: record.cid.clone(),
				});
			}
		}

		let mut head = local.last().map(|record| record.cid.clone());
		let mut appended = Vec::new();
		for record in remote.iter().skip(local.len()) {
			self.stores
				.operations
				.append(record, head.as_ref())
				.await
				.map_err(LifecycleError::store(did))?;
			head = Some(record.cid.clone());
			appended.push(record.cid.clone());
		}

		let tombstoned = validator.is_tombstoned();
		let existing = self
			.stores
			.accounts
			.get(did)
			.await
			.map_err(LifecycleError::store(did))?;
		let latest = remote.last().and_then(|record| record.operation.op.as_regular());
		let account = if tombstoned {
			self.stores
				.keys
				.delete_for_did(did)
				.await
				.map_err(LifecycleError::store(did))?;
			self.stores
				.accounts
				.delete(did)
				.await
				.map_err(LifecycleError::store(did))?;
			None
		} else if let Some(handle) = latest.and_then(|op| op.handle()) {
			let has_key = self
				.stores
				.keys
				.get(did, KEY_LABEL)
				.await
				.map_err(LifecycleError::store(did))?
				.is_some();
			let account = match existing {
				Some(account) if account.handle == handle => Some(account),
				Some(account) => Some(Account {
					handle,
					last_modified: now(),
					..account
				}),
				// Only identities whose key we hold become accounts.
				None if has_key => Some(Account::new(did.clone(), handle)),
				None => None,
			};
			if let Some(account) = &account {
				let _handle_guard = self.handles.acquire(&account.handle).await;
				let holder = self
					.stores
					.accounts
					.get_by_handle(&account.handle)
					.await
					.map_err(LifecycleError::store(did))?;
				if let Some(holder) = holder.filter(|holder| holder.did != *did) {
					warn!(
						handle = %account.handle,
						holder = %holder.did,
						"handle is held by another account"
					);
					return Err(LifecycleError::HandleConflict {
						did: did.clone(),
						handle: account.handle.clone(),
						holder: holder.did,
					});
				}
				self.stores
					.accounts
					.put(account)
					.await
					.map_err(LifecycleError::store(did))?;
			}
			account
		} else {
			existing
		};
		info!(appended = appended.len(), tombstoned, "reconciled");
		Ok(ReconcileReport {
			did: did.clone(),
			appended,
			tombstoned,
			account,
		})
	}

	/// Tombstones `did` with `key`, taking the head from the directory rather
	/// than the local stores. For identities this server does not manage.
	#[instrument(skip(self, key, cancel), fields(%did))]
	pub async fn tombstone_did(
		&self,
		did: &DidPlc,
		key: &SigningKey,
		cancel: &CancellationToken,
	) -> Result<OperationRecord, LifecycleError> {
		let guard = self.dids.acquire(did).await;
		let log = self
			.directory
			.op_log(did)
			.await
			.map_err(|source| LifecycleError::Directory {
				did: did.clone(),
				source,
			})?;
		let validator = ChainValidator::from_log(did.clone(), &log)
			.map_err(|err| LifecycleError::operation(did, OperationKind::Tombstone, err))?;
		let head = match validator.head() {
			_ if validator.is_tombstoned() => {
				return Err(tombstoned(did, OperationKind::Tombstone));
			}
			Some(head) => head.clone(),
			None => {
				return Err(LifecycleError::NotFound {
					did: did.clone(),
					kind: RecordKind::Operation,
				})
			}
		};
		let op = UnsignedOperation::tombstone(head.clone())
			.sign(key)
			.map_err(|err| LifecycleError::operation(did, OperationKind::Tombstone, err))?;
		// Catches a key without authority before the directory does.
		validator
			.check(&op)
			.map_err(|err| LifecycleError::operation(did, OperationKind::Tombstone, err))?;
		let record = self.record(did, op)?;

		// Only a local log that is up to date with the directory is extended.
		let stores = self.stores.clone();
		let (did_, record_) = (did.clone(), record.clone());
		self.commit(&record, guard, cancel, async move {
			let local_head = stores.operations.head(&did_).await?;
			if local_head.is_some_and(|local| local.cid == head) {
				stores.operations.append(&record_, Some(&head)).await?;
			}
			Ok::<_, StoreError>(())
		})
		.await?;
		info!(cid = %record.cid, "tombstoned");
		Ok(record)
	}

	#[instrument(skip(self), fields(%did))]
	pub async fn resolve_did(&self, did: &DidPlc) -> Result<DidDocument, LifecycleError> {
		self.directory
			.resolve(did)
			.await
			.map_err(|source| LifecycleError::Directory {
				did: did.clone(),
				source,
			})
	}

	pub async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
		self.stores.accounts.list().try_collect().await
	}

	async fn account(&self, did: &DidPlc) -> Result<Account, LifecycleError> {
		self.stores
			.accounts
			.get(did)
			.await
			.map_err(LifecycleError::store(did))?
			.ok_or_else(|| LifecycleError::NotFound {
				did: did.clone(),
				kind: RecordKind::Account,
			})
	}

	async fn signing_key(&self, did: &DidPlc) -> Result<SigningKey, LifecycleError> {
		let record = self
			.stores
			.keys
			.get(did, KEY_LABEL)
			.await
			.map_err(LifecycleError::store(did))?
			.ok_or_else(|| LifecycleError::NotFound {
				did: did.clone(),
				kind: RecordKind::Key,
			})?;
		record.signing_key().map_err(|err| LifecycleError::Store {
			subject: did.into(),
			source: StoreError::Corrupt(format!("private key of {did}: {err}")),
		})
	}

	async fn head(&self, did: &DidPlc) -> Result<OperationRecord, LifecycleError> {
		self.stores
			.operations
			.head(did)
			.await
			.map_err(LifecycleError::store(did))?
			.ok_or_else(|| LifecycleError::NotFound {
				did: did.clone(),
				kind: RecordKind::Operation,
			})
	}

	fn record(
		&self,
		did: &DidPlc,
		op: SignedOperation,
	) -> Result<OperationRecord, LifecycleError> {
		let kind = op.kind();
		OperationRecord::new(did.clone(), op)
			.map_err(|err| LifecycleError::operation(did, kind, err))
	}

	/// Submits `record` and then runs `persist`, both on their own task that
	/// owns `held`. The sequence runs to completion even if the caller stops
	/// waiting. Only `cancel` can interrupt the submission.
	async fn commit<G, F>(
		&self,
		record: &OperationRecord,
		held: G,
		cancel: &CancellationToken,
		persist: F,
	) -> Result<(), LifecycleError>
	where
		G: Send + 'static,
		F: Future<Output = Result<(), StoreError>> + Send + 'static,
	{
		let directory = self.directory.clone();
		let cancel = cancel.clone();
		let record_ = record.clone();
		let task = tokio::spawn(
			async move {
				let _held = held;
				submit(directory.as_ref(), &record_, &cancel).await?;
				persist.await.map_err(|source| {
					error!(
						did = %record_.did,
						cid = %record_.cid,
						"directory accepted operation but it was not persisted: {source}"
					);
					LifecycleError::ReconciliationRequired {
						did: record_.did.clone(),
						op: record_.operation.kind(),
						cid: record_.cid.clone(),
						source,
					}
				})
			}
			.in_current_span(),
		);
		match task.await {
			Ok(result) => result,
			Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
			Err(err) => {
				warn!(did = %record.did, cid = %record.cid, "commit task was aborted: {err}");
				Err(LifecycleError::SubmissionInterrupted {
					did: record.did.clone(),
					op: record.operation.kind(),
				})
			}
		}
	}
}

/// Submits `record` to the directory unless `cancel` fires first.
async fn submit(
	directory: &dyn Directory,
	record: &OperationRecord,
	cancel: &CancellationToken,
) -> Result<(), LifecycleError> {
	let (did, op) = (&record.did, record.operation.kind());
	if cancel.is_cancelled() {
		return Err(LifecycleError::Cancelled {
			did: did.clone(),
			op,
		});
	}
	tokio::select! {
		biased;
		() = cancel.cancelled() => {
			warn!(%did, %op, cid = %record.cid, "cancelled while submitting");
			Err(LifecycleError::SubmissionInterrupted { did: did.clone(), op })
		}
		result = directory.submit(did, &record.operation) => {
			result.map_err(|source| {
				warn!(%did, %op, "directory did not accept operation: {source}");
				LifecycleError::DirectorySubmissionFailed {
					did: did.clone(),
					op,
					source,
				}
			})?;
			debug!(%did, %op, cid = %record.cid, "submitted");
			Ok(())
		}
	}
}

fn sign_genesis(
	handle: &Handle,
	service_endpoint: &str,
	key: &SigningKey,
) -> Result<SignedOperation, did_plc::Error> {
	let rotation_key = DidKey::from(&key.verifying_key());
	Ok(UnsignedOperation::genesis(handle.as_str(), service_endpoint, rotation_key)?
		.sign(key)?)
}

fn tombstoned(did: &DidPlc, op: OperationKind) -> LifecycleError {
	LifecycleError::operation(
		did,
		op,
		ChainError::IdentifierTombstoned { did: did.clone() },
	)
}
