use std::{
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use did_plc::{
	document::DidDocument, ChainValidator, Cid, DidPlc, Handle, OperationKind,
	SignedOperation,
};
use pds::{
	error::RecordKind,
	lifecycle::KEY_LABEL,
	store::{
		OperationRecord, OperationsStore, RecordStream, Registries, StoreError, StoreUris,
		Stores,
	},
	DeleteOptions, Directory, DirectoryError, IdentityManager, InMemoryDirectory,
	LifecycleError,
};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

const ENDPOINT: &str = "https://pds.example";

fn manager_with(stores: Stores) -> (Arc<InMemoryDirectory>, IdentityManager) {
	let directory = Arc::new(InMemoryDirectory::new());
	let manager = IdentityManager::new(directory.clone(), stores);
	(directory, manager)
}

fn manager() -> (Arc<InMemoryDirectory>, IdentityManager) {
	manager_with(Stores::in_memory())
}

#[tokio::test]
async fn test_create_account() -> eyre::Result<()> {
	let (directory, manager) = manager();
	let cancel = CancellationToken::new();
	let created = manager.create_account("Alice", ENDPOINT, &cancel).await?;
	let did = created.account.did.clone();
	assert_eq!(created.account.handle.as_str(), "alice");
	let suffix = did.as_str().strip_prefix("did:plc:").expect("did:plc prefix");
	assert_eq!(suffix.len(), 24);
	assert!(suffix.chars().all(|c| matches!(c, 'a'..='z' | '2'..='7')));
	assert_eq!(created.genesis.operation.op.prev(), None);
	assert_eq!(created.key.label, KEY_LABEL);

	let log = directory.op_log(&did).await?;
	assert_eq!(log, [created.genesis.operation.clone()]);
	let doc = directory.resolve(&did).await?;
	assert_eq!(doc.also_known_as, ["at://alice"]);
	assert_eq!(doc.pds_endpoint(), Some(ENDPOINT));

	let stores = manager.stores();
	assert_eq!(stores.accounts.get(&did).await?, Some(created.account));
	let key = stores.keys.get(&did, KEY_LABEL).await?.expect("key is stored");
	assert_eq!(key.public_key, created.key.public_key);
	let head = stores.operations.head(&did).await?.expect("genesis is stored");
	assert_eq!(head.cid, created.genesis.cid);
	Ok(())
}

#[tokio::test]
async fn test_handle_taken_and_invalid() -> eyre::Result<()> {
	let (_directory, manager) = manager();
	let cancel = CancellationToken::new();
	manager.create_account("alice", ENDPOINT, &cancel).await?;
	assert!(matches!(
		manager.create_account("ALICE", ENDPOINT, &cancel).await,
		Err(LifecycleError::HandleTaken(handle)) if handle.as_str() == "alice"
	));
	assert!(matches!(
		manager.create_account("-alice", ENDPOINT, &cancel).await,
		Err(LifecycleError::InvalidHandle(_))
	));
	assert_eq!(manager.list_accounts().await?.len(), 1);
	Ok(())
}

#[tokio::test]
async fn test_update_handle() -> eyre::Result<()> {
	let (directory, manager) = manager();
	let cancel = CancellationToken::new();
	let alice = manager.create_account("alice", ENDPOINT, &cancel).await?;
	let bob = manager.create_account("bob", ENDPOINT, &cancel).await?;
	let did = alice.account.did;

	assert!(matches!(
		manager.update_handle(&did, "bob", &cancel).await,
		Err(LifecycleError::HandleTaken(_))
	));

	let updated = manager.update_handle(&did, "alice.example", &cancel).await?;
	assert_eq!(updated.handle.as_str(), "alice.example");
	assert_eq!(updated.created, alice.account.created);

	let log = directory.op_log(&did).await?;
	assert_eq!(log.len(), 2);
	assert_eq!(log[1].op.prev(), Some(&alice.genesis.cid));
	let doc = directory.resolve(&did).await?;
	assert_eq!(doc.also_known_as, ["at://alice.example"]);

	let local = manager.stores().operations.list_for_did(&did).await?;
	let local_ops: Vec<_> = local.into_iter().map(|r| r.operation).collect();
	assert_eq!(local_ops, log);
	assert_eq!(
		manager.stores().accounts.get(&did).await?,
		Some(updated.clone())
	);

	// The old handle is free again.
	let again = manager.create_account("alice", ENDPOINT, &cancel).await?;
	assert_ne!(again.account.did, did);
	assert_ne!(again.account.did, bob.account.did);
	Ok(())
}

#[tokio::test]
async fn test_concurrent_updates_are_serialized() -> eyre::Result<()> {
	let (directory, manager) = manager();
	let cancel = CancellationToken::new();
	let did = manager
		.create_account("alice", ENDPOINT, &cancel)
		.await?
		.account
		.did;

	let tasks: Vec<_> = ["carol", "dave", "erin"]
		.into_iter()
		.map(|handle| {
			let (manager, did, cancel) = (manager.clone(), did.clone(), cancel.clone());
			tokio::spawn(async move { manager.update_handle(&did, handle, &cancel).await })
		})
		.collect();
	for task in tasks {
		task.await??;
	}

	let log = directory.op_log(&did).await?;
	assert_eq!(log.len(), 4);
	ChainValidator::from_log(did.clone(), &log)?;
	assert_eq!(manager.stores().operations.list_for_did(&did).await?.len(), 4);
	Ok(())
}

#[tokio::test]
async fn test_delete_account() -> eyre::Result<()> {
	let (directory, manager) = manager();
	let cancel = CancellationToken::new();
	let created = manager.create_account("alice", ENDPOINT, &cancel).await?;
	let did = created.account.did;

	let deleted = manager
		.delete_account(&did, DeleteOptions::default(), &cancel)
		.await?;
	assert_eq!(deleted.tombstone.operation.op.prev(), Some(&created.genesis.cid));
	assert!(matches!(
		directory.resolve(&did).await,
		Err(DirectoryError::Rejected { status: 410, .. })
	));

	let stores = manager.stores();
	assert_eq!(stores.accounts.get(&did).await?, None);
	assert_eq!(stores.keys.get(&did, KEY_LABEL).await?, None);
	let kept = stores.operations.list_for_did(&did).await?;
	let cids: Vec<_> = kept.iter().map(|r| r.cid.clone()).collect();
	assert_eq!(cids, [created.genesis.cid.clone(), deleted.tombstone.cid.clone()]);
	assert_eq!(kept[1].operation.kind(), OperationKind::Tombstone);

	assert!(matches!(
		manager.update_handle(&did, "bob", &cancel).await,
		Err(LifecycleError::NotFound {
			kind: RecordKind::Account,
			..
		})
	));
	assert!(matches!(
		manager
			.delete_account(&did, DeleteOptions::default(), &cancel)
			.await,
		Err(LifecycleError::NotFound { .. })
	));
	Ok(())
}

#[tokio::test]
async fn test_delete_account_erasing_operations() -> eyre::Result<()> {
	let (directory, manager) = manager();
	let cancel = CancellationToken::new();
	let did = manager
		.create_account("alice", ENDPOINT, &cancel)
		.await?
		.account
		.did;
	manager
		.delete_account(
			&did,
			DeleteOptions {
				erase_operations: true,
			},
			&cancel,
		)
		.await?;
	assert!(manager
		.stores()
		.operations
		.list_for_did(&did)
		.await?
		.is_empty());
	assert_eq!(directory.op_log(&did).await?.len(), 2);
	Ok(())
}

#[tokio::test]
async fn test_directory_failure_persists_nothing() -> eyre::Result<()> {
	let (directory, manager) = manager();
	let cancel = CancellationToken::new();
	directory.set_unavailable(true);
	let err = manager
		.create_account("alice", ENDPOINT, &cancel)
		.await
		.unwrap_err();
	assert!(matches!(err, LifecycleError::DirectorySubmissionFailed { .. }));
	assert!(err.is_retryable());
	assert!(manager.list_accounts().await?.is_empty());

	directory.set_unavailable(false);
	let created = manager.create_account("alice", ENDPOINT, &cancel).await?;
	directory.set_unavailable(true);
	let err = manager
		.update_handle(&created.account.did, "bob", &cancel)
		.await
		.unwrap_err();
	assert!(err.is_retryable());
	let account = manager.stores().accounts.get(&created.account.did).await?;
	assert_eq!(account.map(|a| a.handle.to_string()), Some("alice".to_owned()));
	Ok(())
}

#[tokio::test]
async fn test_cancelled_before_submission() -> eyre::Result<()> {
	let (_directory, manager) = manager();
	let cancel = CancellationToken::new();
	cancel.cancel();
	let err = manager
		.create_account("alice", ENDPOINT, &cancel)
		.await
		.unwrap_err();
	let LifecycleError::Cancelled { did, .. } = err else {
		panic!("expected cancellation, got {err:?}");
	};
	assert!(matches!(
		manager.directory().op_log(&did).await,
		Err(DirectoryError::NotFound(_))
	));
	assert!(manager.list_accounts().await?.is_empty());
	Ok(())
}

/// Accepts nothing and never answers.
#[derive(Debug)]
struct StalledDirectory;

#[async_trait]
impl Directory for StalledDirectory {
	async fn submit(&self, _: &DidPlc, _: &SignedOperation) -> Result<(), DirectoryError> {
		futures::future::pending().await
	}

	async fn resolve(&self, did: &DidPlc) -> Result<DidDocument, DirectoryError> {
		Err(DirectoryError::NotFound(did.clone()))
	}

	async fn op_log(&self, did: &DidPlc) -> Result<Vec<SignedOperation>, DirectoryError> {
		Err(DirectoryError::NotFound(did.clone()))
	}
}

#[tokio::test]
async fn test_cancelled_during_submission() -> eyre::Result<()> {
	let manager = IdentityManager::new(Arc::new(StalledDirectory), Stores::in_memory());
	let cancel = CancellationToken::new();
	tokio::spawn({
		let cancel = cancel.clone();
		async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			cancel.cancel();
		}
	});
	let err = manager
		.create_account("alice", ENDPOINT, &cancel)
		.await
		.unwrap_err();
	assert!(matches!(err, LifecycleError::SubmissionInterrupted { .. }));
	assert!(!err.is_retryable());
	assert!(manager.list_accounts().await?.is_empty());
	Ok(())
}

/// Holds every submission until released, counting how many arrived.
#[derive(Debug)]
struct GatedDirectory {
	inner: InMemoryDirectory,
	arrived: AtomicUsize,
	entered: Notify,
	release: Semaphore,
}

impl GatedDirectory {
	fn new() -> Self {
		Self {
			inner: InMemoryDirectory::new(),
			arrived: AtomicUsize::new(0),
			entered: Notify::new(),
			release: Semaphore::new(0),
		}
	}
}

#[async_trait]
impl Directory for GatedDirectory {
	async fn submit(&self, did: &DidPlc, op: &SignedOperation) -> Result<(), DirectoryError> {
		self.arrived.fetch_add(1, Ordering::SeqCst);
		self.entered.notify_one();
		let _permit = self.release.acquire().await.expect("semaphore is never closed");
		self.inner.submit(did, op).await
	}

	async fn resolve(&self, did: &DidPlc) -> Result<DidDocument, DirectoryError> {
		self.inner.resolve(did).await
	}

	async fn op_log(&self, did: &DidPlc) -> Result<Vec<SignedOperation>, DirectoryError> {
		self.inner.op_log(did).await
	}
}

#[tokio::test]
async fn test_concurrent_claims_on_a_handle() -> eyre::Result<()> {
	let directory = Arc::new(GatedDirectory::new());
	let manager = IdentityManager::new(directory.clone(), Stores::in_memory());
	let cancel = CancellationToken::new();
	let claim = |handle: &'static str| {
		let (manager, cancel) = (manager.clone(), cancel.clone());
		tokio::spawn(async move { manager.create_account(handle, ENDPOINT, &cancel).await })
	};

	let first = claim("alice");
	directory.entered.notified().await;
	let second = claim("ALICE");
	tokio::time::sleep(Duration::from_millis(50)).await;
	// The second claim waits on the handle instead of submitting its own genesis.
	assert_eq!(directory.arrived.load(Ordering::SeqCst), 1);

	directory.release.add_permits(2);
	let first = first.await??;
	assert!(matches!(
		second.await?,
		Err(LifecycleError::HandleTaken(handle)) if handle.as_str() == "alice"
	));
	assert_eq!(directory.arrived.load(Ordering::SeqCst), 1);
	assert_eq!(manager.list_accounts().await?, [first.account.clone()]);
	assert_eq!(directory.inner.op_log(&first.account.did).await?.len(), 1);
	Ok(())
}

#[tokio::test]
async fn test_reconcile_reports_handle_conflict() -> eyre::Result<()> {
	let (directory, manager) = manager();
	let cancel = CancellationToken::new();
	let alice = manager.create_account("alice", ENDPOINT, &cancel).await?;

	// A second server holding the key of another DID moves it onto "alice".
	let elsewhere = IdentityManager::new(directory.clone(), Stores::in_memory());
	let bob = elsewhere.create_account("bob", ENDPOINT, &cancel).await?;
	let did = bob.account.did;
	elsewhere.update_handle(&did, "alice", &cancel).await?;
	manager.stores().keys.put(&bob.key).await?;

	let err = manager.reconcile(&did).await.unwrap_err();
	let LifecycleError::HandleConflict { handle, holder, .. } = &err else {
		panic!("expected a handle conflict, got {err:?}");
	};
	assert_eq!(handle.as_str(), "alice");
	assert_eq!(holder, &alice.account.did);
	assert!(!err.is_retryable());
	assert_eq!(manager.stores().operations.list_for_did(&did).await?.len(), 2);
	assert_eq!(manager.stores().accounts.get(&did).await?, None);
	Ok(())
}

/// Accepts submissions right away but answers late.
#[derive(Debug)]
struct SlowAckDirectory {
	inner: InMemoryDirectory,
	delay: Duration,
}

#[async_trait]
impl Directory for SlowAckDirectory {
	async fn submit(&self, did: &DidPlc, op: &SignedOperation) -> Result<(), DirectoryError> {
		self.inner.submit(did, op).await?;
		tokio::time::sleep(self.delay).await;
		Ok(())
	}

	async fn resolve(&self, did: &DidPlc) -> Result<DidDocument, DirectoryError> {
		self.inner.resolve(did).await
	}

	async fn op_log(&self, did: &DidPlc) -> Result<Vec<SignedOperation>, DirectoryError> {
		self.inner.op_log(did).await
	}
}

#[tokio::test]
async fn test_dropped_caller_still_persists() -> eyre::Result<()> {
	let directory = Arc::new(SlowAckDirectory {
		inner: InMemoryDirectory::new(),
		delay: Duration::from_millis(200),
	});
	let manager = IdentityManager::new(directory.clone(), Stores::in_memory());
	let cancel = CancellationToken::new();

	let attempt = tokio::time::timeout(
		Duration::from_millis(20),
		manager.create_account("alice", ENDPOINT, &cancel),
	)
	.await;
	assert!(attempt.is_err(), "create_account finished before the deadline");

	let handle = Handle::parse("alice")?;
	let accounts = manager.stores().accounts.clone();
	let account = tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			if let Some(account) = accounts.get_by_handle(&handle).await? {
				return Ok::<_, StoreError>(account);
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	})
	.await??;
	let did = account.did;
	let log = directory.inner.op_log(&did).await?;
	let local = manager.stores().operations.list_for_did(&did).await?;
	assert_eq!(log.len(), 1);
	assert_eq!(local.len(), 1);
	assert_eq!(local[0].operation, log[0]);
	assert!(manager.stores().keys.get(&did, KEY_LABEL).await?.is_some());

	// The abandoned commit released its lock.
	manager.update_handle(&did, "bob", &cancel).await?;
	assert_eq!(directory.inner.op_log(&did).await?.len(), 2);
	Ok(())
}

/// Delegates to another store, but can be told to fail every append.
#[derive(Debug)]
struct FlakyOperations {
	inner: Arc<dyn OperationsStore>,
	fail_appends: AtomicBool,
}

#[async_trait]
impl OperationsStore for FlakyOperations {
	async fn get(&self, cid: &Cid) -> Result<Option<OperationRecord>, StoreError> {
		self.inner.get(cid).await
	}

	async fn head(&self, did: &DidPlc) -> Result<Option<OperationRecord>, StoreError> {
		self.inner.head(did).await
	}

	async fn list_for_did(&self, did: &DidPlc) -> Result<Vec<OperationRecord>, StoreError> {
		self.inner.list_for_did(did).await
	}

	async fn append(
		&self,
		record: &OperationRecord,
		expected_head: Option<&Cid>,
	) -> Result<(), StoreError> {
		if self.fail_appends.load(Ordering::SeqCst) {
			return Err(StoreError::Io(std::io::Error::other("disk full")));
		}
		self.inner.append(record, expected_head).await
	}

	async fn purge(&self, did: &DidPlc) -> Result<(), StoreError> {
		self.inner.purge(did).await
	}

	fn list(&self) -> RecordStream<'_, OperationRecord> {
		self.inner.list()
	}
}

#[tokio::test]
async fn test_failed_persistence_is_reconciled() -> eyre::Result<()> {
	let memory = Stores::in_memory();
	let operations = Arc::new(FlakyOperations {
		inner: memory.operations.clone(),
		fail_appends: AtomicBool::new(true),
	});
	let stores = Stores {
		operations: operations.clone(),
		..memory
	};
	let (directory, manager) = manager_with(stores);
	let cancel = CancellationToken::new();

	let err = manager
		.create_account("alice", ENDPOINT, &cancel)
		.await
		.unwrap_err();
	let LifecycleError::ReconciliationRequired { did, cid, .. } = &err else {
		panic!("expected reconciliation, got {err:?}");
	};
	assert!(!err.is_retryable());
	assert_eq!(directory.op_log(did).await?.len(), 1);
	assert_eq!(manager.stores().accounts.get(did).await?, None);

	operations.fail_appends.store(false, Ordering::SeqCst);
	let report = manager.reconcile(did).await?;
	assert_eq!(report.appended, [cid.clone()]);
	assert!(!report.tombstoned);
	let account = report.account.expect("account is restored");
	assert_eq!(account.handle.as_str(), "alice");

	// The account works normally afterwards.
	manager.update_handle(did, "bob", &cancel).await?;
	let report = manager.reconcile(did).await?;
	assert!(report.appended.is_empty());
	Ok(())
}

#[tokio::test]
async fn test_reconcile_tombstone_from_elsewhere() -> eyre::Result<()> {
	let (directory, manager) = manager();
	let cancel = CancellationToken::new();
	let created = manager.create_account("alice", ENDPOINT, &cancel).await?;
	let did = created.account.did;

	// Another holder of the key tombstones the DID behind our back.
	let key = created.key.signing_key()?;
	let elsewhere = IdentityManager::new(directory.clone(), Stores::null());
	elsewhere.tombstone_did(&did, &key, &cancel).await?;

	let report = manager.reconcile(&did).await?;
	assert!(report.tombstoned);
	assert_eq!(report.appended.len(), 1);
	assert_eq!(manager.stores().accounts.get(&did).await?, None);
	assert_eq!(manager.stores().keys.get(&did, KEY_LABEL).await?, None);

	assert!(matches!(
		elsewhere.tombstone_did(&did, &key, &cancel).await,
		Err(LifecycleError::Operation { .. })
	));
	Ok(())
}

#[tokio::test]
async fn test_tombstone_did_requires_authority() -> eyre::Result<()> {
	let (directory, manager) = manager_with(Stores::null());
	let cancel = CancellationToken::new();
	let created = manager.create_account("alice", ENDPOINT, &cancel).await?;
	let did = created.account.did;
	assert!(manager.list_accounts().await?.is_empty());

	let intruder = did_simple::crypto::secp256k1::SigningKey::generate()?;
	assert!(matches!(
		manager.tombstone_did(&did, &intruder, &cancel).await,
		Err(LifecycleError::Operation { .. })
	));
	assert_eq!(directory.op_log(&did).await?.len(), 1);

	let key = created.key.signing_key()?;
	manager.tombstone_did(&did, &key, &cancel).await?;
	assert_eq!(directory.op_log(&did).await?.len(), 2);
	Ok(())
}

#[tokio::test]
async fn test_lifecycle_against_sqlite() -> eyre::Result<()> {
	let stores = Registries::with_default_backends()?
		.open(&StoreUris::all("sqlite::memory:"))
		.await?;
	let (directory, manager) = manager_with(stores);
	let cancel = CancellationToken::new();

	let did = manager
		.create_account("alice", ENDPOINT, &cancel)
		.await?
		.account
		.did;
	manager.update_handle(&did, "alice.example", &cancel).await?;
	manager
		.delete_account(&did, DeleteOptions::default(), &cancel)
		.await?;

	let log = directory.op_log(&did).await?;
	let local: Vec<_> = manager
		.stores()
		.operations
		.list_for_did(&did)
		.await?
		.into_iter()
		.map(|r| r.operation)
		.collect();
	assert_eq!(local, log);
	assert!(manager.list_accounts().await?.is_empty());
	Ok(())
}
