//! Stores that keep one JSON blob per record in a [`Bucket`].
//!
//! Layout inside the bucket:
//!
//! ```text
//! accounts/{did}.json
//! keys/{did}/{label}.json
//! operations/{did}/{cid}.json
//! ```

use std::{collections::BTreeMap, fmt::Debug, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use did_plc::{Cid, DidPlc, Handle};
use futures::{stream, StreamExt as _};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use super::{
	order_chain, Account, AccountsStore, KeyRecord, KeysStore, OperationRecord,
	OperationsStore, RecordStream, StoreError,
};

/// A flat namespace of byte blobs. Keys are `/` separated paths.
#[async_trait]
pub trait Bucket: Debug + Send + Sync + 'static {
	async fn read(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
	async fn write(&self, key: &str, data: Bytes) -> Result<(), StoreError>;
	/// Deleting a missing key is not an error.
	async fn delete(&self, key: &str) -> Result<(), StoreError>;
	/// Every key that starts with `prefix`, sorted.
	async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// A bucket that lives in memory, for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryBucket {
	blobs: RwLock<BTreeMap<String, Bytes>>,
}

#[async_trait]
impl Bucket for MemoryBucket {
	async fn read(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
		Ok(self.blobs.read().await.get(key).cloned())
	}

	async fn write(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
		self.blobs.write().await.insert(key.to_owned(), data);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.blobs.write().await.remove(key);
		Ok(())
	}

	async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
		Ok(self
			.blobs
			.read()
			.await
			.range(prefix.to_owned()..)
			.map(|(k, _)| k)
			.take_while(|k| k.starts_with(prefix))
			.cloned()
			.collect())
	}
}

/// A bucket backed by a directory on the local filesystem.
#[derive(Debug)]
pub struct FileBucket {
	root: PathBuf,
}

impl FileBucket {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
		if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
			return Err(StoreError::Corrupt(format!("invalid blob key {key:?}")));
		}
		Ok(self.root.join(key))
	}
}

#[async_trait]
impl Bucket for FileBucket {
	async fn read(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
		match tokio::fs::read(self.path(key)?).await {
			Ok(data) => Ok(Some(data.into())),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(err) => Err(err.into()),
		}
	}

	async fn write(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
		let path = self.path(key)?;
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		// Write then rename, so readers never observe a partial blob.
		let tmp = path.with_extension("tmp");
		tokio::fs::write(&tmp, &data).await?;
		tokio::fs::rename(&tmp, &path).await?;
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		match tokio::fs::remove_file(self.path(key)?).await {
			Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
			_ => Ok(()),
		}
	}

	async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
		let mut keys = Vec::new();
		let mut pending = vec![(self.root.clone(), String::new())];
		while let Some((dir, dir_key)) = pending.pop() {
			let mut entries = match tokio::fs::read_dir(&dir).await {
				Ok(entries) => entries,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
				Err(err) => return Err(err.into()),
			};
			while let Some(entry) = entries.next_entry().await? {
				let name = entry.file_name().to_string_lossy().into_owned();
				let key = format!("{dir_key}{name}");
				if entry.file_type().await?.is_dir() {
					let dir_prefix = format!("{key}/");
					if dir_prefix.starts_with(prefix) || prefix.starts_with(&dir_prefix) {
						pending.push((entry.path(), dir_prefix));
					}
				} else if key.starts_with(prefix) && !key.ends_with(".tmp") {
					keys.push(key);
				}
			}
		}
		keys.sort();
		Ok(keys)
	}
}

async fn read_json<T: DeserializeOwned>(
	bucket: &dyn Bucket,
	key: &str,
) -> Result<Option<T>, StoreError> {
	bucket
		.read(key)
		.await?
		.map(|data| serde_json::from_slice(&data))
		.transpose()
		.map_err(StoreError::from)
}

async fn write_json<T: Serialize>(
	bucket: &dyn Bucket,
	key: &str,
	value: &T,
) -> Result<(), StoreError> {
	let data = serde_json::to_vec_pretty(value)?;
	bucket.write(key, data.into()).await
}

async fn read_all<T: DeserializeOwned>(
	bucket: &dyn Bucket,
	prefix: &str,
) -> Result<Vec<T>, StoreError> {
	let mut out = Vec::new();
	for key in bucket.list(prefix).await? {
		// Racing deletes are skipped rather than reported.
		if let Some(value) = read_json(bucket, &key).await? {
			out.push(value);
		}
	}
	Ok(out)
}

/// Streams every record under `prefix`.
fn stream_all<'a, T: DeserializeOwned + Send + 'a>(
	bucket: &'a dyn Bucket,
	prefix: &'static str,
) -> RecordStream<'a, T> {
	stream::once(bucket.list(prefix))
		.flat_map(move |keys| match keys {
			Ok(keys) => stream::iter(keys).map(Ok).left_stream(),
			Err(err) => stream::iter([Err(err)]).right_stream(),
		})
		.filter_map(move |key| async move {
			match key {
				Ok(key) => read_json(bucket, &key).await.transpose(),
				Err(err) => Some(Err(err)),
			}
		})
		.boxed()
}

#[derive(Debug)]
pub struct BlobAccountsStore {
	bucket: Arc<dyn Bucket>,
	/// Serializes writes, so the handle uniqueness check can't race.
	write_lock: Mutex<()>,
}

impl BlobAccountsStore {
	const PREFIX: &'static str = "accounts/";

	pub fn new(bucket: Arc<dyn Bucket>) -> Self {
		Self {
			bucket,
			write_lock: Mutex::new(()),
		}
	}

	fn key(did: &DidPlc) -> String {
		format!("{}{did}.json", Self::PREFIX)
	}
}

#[async_trait]
impl AccountsStore for BlobAccountsStore {
	async fn get(&self, did: &DidPlc) -> Result<Option<Account>, StoreError> {
		read_json(self.bucket.as_ref(), &Self::key(did)).await
	}

	async fn get_by_handle(&self, handle: &Handle) -> Result<Option<Account>, StoreError> {
		let accounts: Vec<Account> = read_all(self.bucket.as_ref(), Self::PREFIX).await?;
		Ok(accounts.into_iter().find(|a| &a.handle == handle))
	}

	#[instrument(skip_all, fields(did = %account.did, handle = %account.handle))]
	async fn put(&self, account: &Account) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().await;
		if let Some(holder) = self.get_by_handle(&account.handle).await? {
			if holder.did != account.did {
				return Err(StoreError::Conflict(format!("handle {}", account.handle)));
			}
		}
		write_json(self.bucket.as_ref(), &Self::key(&account.did), account).await
	}

	async fn delete(&self, did: &DidPlc) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().await;
		self.bucket.delete(&Self::key(did)).await
	}

	fn list(&self) -> RecordStream<'_, Account> {
		stream_all(self.bucket.as_ref(), Self::PREFIX)
	}
}

#[derive(Debug)]
pub struct BlobKeysStore {
	bucket: Arc<dyn Bucket>,
}

impl BlobKeysStore {
	const PREFIX: &'static str = "keys/";

	pub fn new(bucket: Arc<dyn Bucket>) -> Self {
		Self { bucket }
	}

	fn did_prefix(did: &DidPlc) -> String {
		format!("{}{did}/", Self::PREFIX)
	}

	fn key(did: &DidPlc, label: &str) -> String {
		format!("{}{label}.json", Self::did_prefix(did))
	}
}

#[async_trait]
impl KeysStore for BlobKeysStore {
	async fn get(&self, did: &DidPlc, label: &str) -> Result<Option<KeyRecord>, StoreError> {
		read_json(self.bucket.as_ref(), &Self::key(did, label)).await
	}

	#[instrument(skip_all, fields(did = %key.did, label = %key.label))]
	async fn put(&self, key: &KeyRecord) -> Result<(), StoreError> {
		write_json(self.bucket.as_ref(), &Self::key(&key.did, &key.label), key).await
	}

	async fn delete(&self, did: &DidPlc, label: &str) -> Result<(), StoreError> {
		self.bucket.delete(&Self::key(did, label)).await
	}

	#[instrument(skip(self))]
	async fn delete_for_did(&self, did: &DidPlc) -> Result<(), StoreError> {
		for key in self.bucket.list(&Self::did_prefix(did)).await? {
			self.bucket.delete(&key).await?;
		}
		Ok(())
	}

	fn list(&self) -> RecordStream<'_, KeyRecord> {
		stream_all(self.bucket.as_ref(), Self::PREFIX)
	}
}

#[derive(Debug)]
pub struct BlobOperationsStore {
	bucket: Arc<dyn Bucket>,
	/// Makes the head check and the write of `append` atomic.
	append_lock: Mutex<()>,
}

impl BlobOperationsStore {
	const PREFIX: &'static str = "operations/";

	pub fn new(bucket: Arc<dyn Bucket>) -> Self {
		Self {
			bucket,
			append_lock: Mutex::new(()),
		}
	}

	fn did_prefix(did: &DidPlc) -> String {
		format!("{}{did}/", Self::PREFIX)
	}

	fn key(did: &DidPlc, cid: &Cid) -> String {
		format!("{}{cid}.json", Self::did_prefix(did))
	}
}

#[async_trait]
impl OperationsStore for BlobOperationsStore {
	async fn get(&self, cid: &Cid) -> Result<Option<OperationRecord>, StoreError> {
		// The layout is keyed by DID first, so look the CID up among all DIDs.
		let suffix = format!("/{cid}.json");
		let keys = self.bucket.list(Self::PREFIX).await?;
		match keys.iter().find(|k| k.ends_with(&suffix)) {
			Some(key) => read_json(self.bucket.as_ref(), key).await,
			None => Ok(None),
		}
	}

	async fn head(&self, did: &DidPlc) -> Result<Option<OperationRecord>, StoreError> {
		Ok(self.list_for_did(did).await?.pop())
	}

	async fn list_for_did(&self, did: &DidPlc) -> Result<Vec<OperationRecord>, StoreError> {
		let records = read_all(self.bucket.as_ref(), &Self::did_prefix(did)).await?;
		order_chain(records)
	}

	#[instrument(skip_all, fields(did = %record.did, cid = %record.cid))]
	async fn append(
		&self,
		record: &OperationRecord,
		expected_head: Option<&Cid>,
	) -> Result<(), StoreError> {
		let _guard = self.append_lock.lock().await;
		let head = self.head(&record.did).await?.map(|r| r.cid);
		if head.as_ref() != expected_head {
			return Err(StoreError::HeadMismatch {
				did: record.did.clone(),
				expected: expected_head.cloned(),
				found: head,
			});
		}
		write_json(
			self.bucket.as_ref(),
			&Self::key(&record.did, &record.cid),
			record,
		)
		.await
	}

	#[instrument(skip(self))]
	async fn purge(&self, did: &DidPlc) -> Result<(), StoreError> {
		let _guard = self.append_lock.lock().await;
		for key in self.bucket.list(&Self::did_prefix(did)).await? {
			self.bucket.delete(&key).await?;
		}
		Ok(())
	}

	fn list(&self) -> RecordStream<'_, OperationRecord> {
		stream_all(self.bucket.as_ref(), Self::PREFIX)
	}
}
