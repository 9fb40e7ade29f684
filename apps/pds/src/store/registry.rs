//! Maps URI schemes to store constructors.
//!
//! Registration is expected to happen at startup. Each registration swaps in
//! a new immutable map under a mutex, so lookups never take a lock.

use std::{
	collections::HashMap,
	fmt::Debug,
	future::Future,
	sync::{Arc, Mutex, PoisonError},
};

use arc_swap::ArcSwap;
use futures::{future::BoxFuture, FutureExt as _};
use tracing::debug;
use url::Url;

use super::{
	blob::{
		BlobAccountsStore, BlobKeysStore, BlobOperationsStore, Bucket, FileBucket,
		MemoryBucket,
	},
	null::NullStore,
	sql::{MigratedDbPool, SqlAccountsStore, SqlKeysStore, SqlOperationsStore},
	AccountsStore, KeysStore, OperationsStore, StoreError, Stores,
};

type Constructor<T> =
	Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<T>, StoreError>> + Send + Sync>;

/// Store constructors for one kind of store, keyed by URI scheme.
pub struct Registry<T: ?Sized> {
	constructors: ArcSwap<HashMap<String, Constructor<T>>>,
	register_lock: Mutex<()>,
}

impl<T: ?Sized + 'static> Registry<T> {
	pub fn new() -> Self {
		Self {
			constructors: ArcSwap::from_pointee(HashMap::new()),
			register_lock: Mutex::new(()),
		}
	}

	/// Registers the constructor for `scheme`. Each scheme can only be
	/// registered once.
	pub fn register<F, Fut>(&self, scheme: &str, constructor: F) -> Result<(), StoreError>
	where
		F: Fn(String) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Arc<T>, StoreError>> + Send + 'static,
	{
		let _guard = self
			.register_lock
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		let current = self.constructors.load();
		if current.contains_key(scheme) {
			return Err(StoreError::DuplicateScheme(scheme.to_owned()));
		}
		let mut updated = HashMap::clone(&current);
		let constructor: Constructor<T> = Arc::new(move |uri| constructor(uri).boxed());
		updated.insert(scheme.to_owned(), constructor);
		self.constructors.store(Arc::new(updated));
		debug!(scheme, "registered store backend");
		Ok(())
	}

	/// Opens the store that `uri` describes.
	pub async fn open(&self, uri: &str) -> Result<Arc<T>, StoreError> {
		let scheme = Url::parse(uri)
			.map_err(|err| StoreError::InvalidUri {
				uri: uri.to_owned(),
				reason: err.to_string(),
			})?
			.scheme()
			.to_owned();
		let constructor = self
			.constructors
			.load()
			.get(&scheme)
			.cloned()
			.ok_or(StoreError::UnknownScheme(scheme))?;
		constructor(uri.to_owned()).await
	}

	pub fn schemes(&self) -> Vec<String> {
		let mut schemes: Vec<_> = self.constructors.load().keys().cloned().collect();
		schemes.sort();
		schemes
	}
}

impl<T: ?Sized + 'static> Default for Registry<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: ?Sized + 'static> Debug for Registry<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Registry")
			.field("schemes", &self.schemes())
			.finish()
	}
}

/// Where each kind of record lives.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoreUris {
	pub accounts: String,
	pub keys: String,
	pub operations: String,
}

impl StoreUris {
	/// Every kind of record in the same place.
	pub fn all(uri: &str) -> Self {
		Self {
			accounts: uri.to_owned(),
			keys: uri.to_owned(),
			operations: uri.to_owned(),
		}
	}
}

#[derive(Debug, Default)]
pub struct Registries {
	pub accounts: Registry<dyn AccountsStore>,
	pub keys: Registry<dyn KeysStore>,
	pub operations: Registry<dyn OperationsStore>,
}

fn file_bucket(uri: &str) -> Result<Arc<dyn Bucket>, StoreError> {
	let invalid = |reason: &str| StoreError::InvalidUri {
		uri: uri.to_owned(),
		reason: reason.to_owned(),
	};
	let path = Url::parse(uri)
		.map_err(|err| invalid(&err.to_string()))?
		.to_file_path()
		.map_err(|()| invalid("not an absolute file path"))?;
	Ok(Arc::new(FileBucket::new(path)))
}

impl Registries {
	/// Registries with `sqlite:`, `file:`, `mem:` and `null:` backends.
	pub fn with_default_backends() -> Result<Self, StoreError> {
		let this = Self::default();
		this.register_defaults()?;
		Ok(this)
	}

	/// Registers the `sqlite:`, `file:`, `mem:` and `null:` backends.
	pub fn register_defaults(&self) -> Result<(), StoreError> {
		macro_rules! register {
			($registry:expr, $scheme:literal, $store:ident, |$uri:ident| $make:expr) => {
				$registry.register($scheme, |$uri: String| async move {
					let store: Arc<dyn $store> = Arc::new($make);
					Ok::<_, StoreError>(store)
				})?;
			};
		}

		register!(self.accounts, "sqlite", AccountsStore, |uri| {
			SqlAccountsStore::new(MigratedDbPool::connect(&uri).await?)
		});
		register!(self.keys, "sqlite", KeysStore, |uri| {
			SqlKeysStore::new(MigratedDbPool::connect(&uri).await?)
		});
		register!(self.operations, "sqlite", OperationsStore, |uri| {
			SqlOperationsStore::new(MigratedDbPool::connect(&uri).await?)
		});

		register!(self.accounts, "file", AccountsStore, |uri| {
			BlobAccountsStore::new(file_bucket(&uri)?)
		});
		register!(self.keys, "file", KeysStore, |uri| {
			BlobKeysStore::new(file_bucket(&uri)?)
		});
		register!(self.operations, "file", OperationsStore, |uri| {
			BlobOperationsStore::new(file_bucket(&uri)?)
		});

		// Every `mem:` store gets a fresh bucket.
		register!(self.accounts, "mem", AccountsStore, |_uri| {
			BlobAccountsStore::new(Arc::new(MemoryBucket::default()))
		});
		register!(self.keys, "mem", KeysStore, |_uri| {
			BlobKeysStore::new(Arc::new(MemoryBucket::default()))
		});
		register!(self.operations, "mem", OperationsStore, |_uri| {
			BlobOperationsStore::new(Arc::new(MemoryBucket::default()))
		});

		register!(self.accounts, "null", AccountsStore, |_uri| NullStore);
		register!(self.keys, "null", KeysStore, |_uri| NullStore);
		register!(self.operations, "null", OperationsStore, |_uri| NullStore);
		Ok(())
	}

	pub async fn open(&self, uris: &StoreUris) -> Result<Stores, StoreError> {
		Ok(Stores {
			accounts: self.accounts.open(&uris.accounts).await?,
			keys: self.keys.open(&uris.keys).await?,
			operations: self.operations.open(&uris.operations).await?,
		})
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use std::str::FromStr;

	use did_plc::{DidPlc, Handle};

	use crate::store::Account;

	#[tokio::test]
	async fn test_default_schemes() -> eyre::Result<()> {
		let registries = Registries::with_default_backends()?;
		assert_eq!(
			registries.accounts.schemes(),
			["file", "mem", "null", "sqlite"]
		);

		let dir = tempfile::tempdir()?;
		let file_uri = Url::from_directory_path(dir.path())
			.map_err(|()| eyre::eyre!("tempdir is not absolute"))?;
		for uri in ["mem://", "null://", "sqlite::memory:", file_uri.as_str()] {
			let stores = registries.open(&StoreUris::all(uri)).await?;
			let did = DidPlc::from_str("did:plc:ewvi7nxzyoun6zhxrhs64oiz")?;
			let account = Account::new(did.clone(), Handle::parse("alice")?);
			stores.accounts.put(&account).await?;
			let expected = (uri != "null://").then_some(account);
			assert_eq!(stores.accounts.get(&did).await?, expected, "uri was {uri}");
		}
		Ok(())
	}

	#[tokio::test]
	async fn test_unknown_and_duplicate_schemes() -> eyre::Result<()> {
		let registries = Registries::with_default_backends()?;
		assert!(matches!(
			registries.keys.open("s3://bucket").await,
			Err(StoreError::UnknownScheme(scheme)) if scheme == "s3"
		));
		assert!(matches!(
			registries.keys.open("not a uri").await,
			Err(StoreError::InvalidUri { .. })
		));
		assert!(matches!(
			registries
				.keys
				.register("null", |_| async {
					Ok::<_, StoreError>(Arc::new(NullStore) as Arc<dyn KeysStore>)
				}),
			Err(StoreError::DuplicateScheme(_))
		));
		Ok(())
	}
}
