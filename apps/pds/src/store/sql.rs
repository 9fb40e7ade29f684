//! SQLite backed stores.

use std::str::FromStr;

use async_trait::async_trait;
use did_plc::{Cid, DidKey, DidPlc, Handle};
use futures::{StreamExt as _, TryStreamExt as _};
use sqlx::{
	sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
	Row as _, SqlitePool,
};
use tracing::instrument;

use super::{
	Account, AccountsStore, KeyRecord, KeysStore, OperationRecord, OperationsStore,
	RecordStream, StoreError,
};

/// A connection pool whose database has had all migrations applied.
#[derive(Debug, Clone)]
pub struct MigratedDbPool(SqlitePool);

impl MigratedDbPool {
	pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
		sqlx::migrate!("./migrations").run(&pool).await?;
		Ok(Self(pool))
	}

	/// Connects to a `sqlite:` URI, creating the database if it is missing.
	pub async fn connect(uri: &str) -> Result<Self, StoreError> {
		let connect_opts = SqliteConnectOptions::from_str(uri)?.create_if_missing(true);
		let mut pool_opts = SqlitePoolOptions::new();
		if uri.contains(":memory:") {
			// Every connection to an in-memory database sees its own database,
			// and the database dies with its last connection.
			pool_opts = pool_opts
				.max_connections(1)
				.min_connections(1)
				.idle_timeout(None)
				.max_lifetime(None);
		}
		let pool = pool_opts.connect_with(connect_opts).await?;
		Self::new(pool).await
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.0
	}
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
	StoreError::Corrupt(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
	matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Debug, Clone)]
pub struct SqlAccountsStore {
	db: MigratedDbPool,
}

impl SqlAccountsStore {
	pub fn new(db: MigratedDbPool) -> Self {
		Self { db }
	}

	fn from_row(row: SqliteRow) -> Result<Account, StoreError> {
		Ok(Account {
			did: DidPlc::from_str(row.try_get("did")?).map_err(corrupt)?,
			handle: Handle::parse(row.try_get("handle")?).map_err(corrupt)?,
			created: row.try_get("created")?,
			last_modified: row.try_get("last_modified")?,
		})
	}
}

#[async_trait]
impl AccountsStore for SqlAccountsStore {
	async fn get(&self, did: &DidPlc) -> Result<Option<Account>, StoreError> {
		sqlx::query(
			"SELECT did, handle, created, last_modified FROM accounts WHERE did = ?",
		)
		.bind(did.as_str())
		.fetch_optional(self.db.pool())
		.await?
		.map(Self::from_row)
		.transpose()
	}

	async fn get_by_handle(&self, handle: &Handle) -> Result<Option<Account>, StoreError> {
		sqlx::query(
			"SELECT did, handle, created, last_modified FROM accounts WHERE handle = ?",
		)
		.bind(handle.as_str())
		.fetch_optional(self.db.pool())
		.await?
		.map(Self::from_row)
		.transpose()
	}

	#[instrument(skip_all, fields(did = %account.did, handle = %account.handle))]
	async fn put(&self, account: &Account) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO accounts (did, handle, created, last_modified) VALUES (?, ?, ?, ?)
			ON CONFLICT (did) DO UPDATE SET
				handle = excluded.handle,
				last_modified = excluded.last_modified",
		)
		.bind(account.did.as_str())
		.bind(account.handle.as_str())
		.bind(account.created)
		.bind(account.last_modified)
		.execute(self.db.pool())
		.await
		.map_err(|err| {
			if is_unique_violation(&err) {
				StoreError::Conflict(format!("handle {}", account.handle))
			} else {
				err.into()
			}
		})?;
		Ok(())
	}

	async fn delete(&self, did: &DidPlc) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM accounts WHERE did = ?")
			.bind(did.as_str())
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	fn list(&self) -> RecordStream<'_, Account> {
		sqlx::query(
			"SELECT did, handle, created, last_modified FROM accounts ORDER BY created DESC",
		)
		.fetch(self.db.pool())
		.map_err(StoreError::from)
		.and_then(|row| async move { Self::from_row(row) })
		.boxed()
	}
}

#[derive(Debug, Clone)]
pub struct SqlKeysStore {
	db: MigratedDbPool,
}

impl SqlKeysStore {
	pub fn new(db: MigratedDbPool) -> Self {
		Self { db }
	}

	fn from_row(row: SqliteRow) -> Result<KeyRecord, StoreError> {
		Ok(KeyRecord {
			did: DidPlc::from_str(row.try_get("did")?).map_err(corrupt)?,
			label: row.try_get("label")?,
			public_key: DidKey::from_str(row.try_get("public_key")?).map_err(corrupt)?,
			private_key: row.try_get("private_key")?,
			created: row.try_get("created")?,
			last_modified: row.try_get("last_modified")?,
		})
	}
}

#[async_trait]
impl KeysStore for SqlKeysStore {
	async fn get(&self, did: &DidPlc, label: &str) -> Result<Option<KeyRecord>, StoreError> {
		sqlx::query(
			"SELECT did, label, public_key, private_key, created, last_modified
			FROM keys WHERE did = ? AND label = ?",
		)
		.bind(did.as_str())
		.bind(label)
		.fetch_optional(self.db.pool())
		.await?
		.map(Self::from_row)
		.transpose()
	}

	#[instrument(skip_all, fields(did = %key.did, label = %key.label))]
	async fn put(&self, key: &KeyRecord) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO keys (did, label, public_key, private_key, created, last_modified)
			VALUES (?, ?, ?, ?, ?, ?)
			ON CONFLICT (did, label) DO UPDATE SET
				public_key = excluded.public_key,
				private_key = excluded.private_key,
				last_modified = excluded.last_modified",
		)
		.bind(key.did.as_str())
		.bind(&key.label)
		.bind(key.public_key.as_str())
		.bind(&key.private_key)
		.bind(key.created)
		.bind(key.last_modified)
		.execute(self.db.pool())
		.await?;
		Ok(())
	}

	async fn delete(&self, did: &DidPlc, label: &str) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM keys WHERE did = ? AND label = ?")
			.bind(did.as_str())
			.bind(label)
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	#[instrument(skip(self))]
	async fn delete_for_did(&self, did: &DidPlc) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM keys WHERE did = ?")
			.bind(did.as_str())
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	fn list(&self) -> RecordStream<'_, KeyRecord> {
		sqlx::query(
			"SELECT did, label, public_key, private_key, created, last_modified
			FROM keys ORDER BY created DESC",
		)
		.fetch(self.db.pool())
		.map_err(StoreError::from)
		.and_then(|row| async move { Self::from_row(row) })
		.boxed()
	}
}

#[derive(Debug, Clone)]
pub struct SqlOperationsStore {
	db: MigratedDbPool,
}

impl SqlOperationsStore {
	pub fn new(db: MigratedDbPool) -> Self {
		Self { db }
	}

	fn from_row(row: SqliteRow) -> Result<OperationRecord, StoreError> {
		let operation: String = row.try_get("operation")?;
		Ok(OperationRecord {
			cid: Cid::from_str(row.try_get("cid")?).map_err(corrupt)?,
			did: DidPlc::from_str(row.try_get("did")?).map_err(corrupt)?,
			operation: serde_json::from_str(&operation)?,
			created: row.try_get("created")?,
			last_modified: row.try_get("last_modified")?,
		})
	}
}

const SELECT_OPERATION: &str =
	"SELECT cid, did, operation, created, last_modified FROM operations";

#[async_trait]
impl OperationsStore for SqlOperationsStore {
	async fn get(&self, cid: &Cid) -> Result<Option<OperationRecord>, StoreError> {
		sqlx::query(&format!("{SELECT_OPERATION} WHERE cid = ?"))
			.bind(cid.as_str())
			.fetch_optional(self.db.pool())
			.await?
			.map(Self::from_row)
			.transpose()
	}

	async fn head(&self, did: &DidPlc) -> Result<Option<OperationRecord>, StoreError> {
		sqlx::query(&format!(
			"{SELECT_OPERATION} WHERE did = ? ORDER BY seq DESC LIMIT 1"
		))
		.bind(did.as_str())
		.fetch_optional(self.db.pool())
		.await?
		.map(Self::from_row)
		.transpose()
	}

	async fn list_for_did(&self, did: &DidPlc) -> Result<Vec<OperationRecord>, StoreError> {
		sqlx::query(&format!("{SELECT_OPERATION} WHERE did = ? ORDER BY seq ASC"))
			.bind(did.as_str())
			.fetch_all(self.db.pool())
			.await?
			.into_iter()
			.map(Self::from_row)
			.collect()
	}

	#[instrument(skip_all, fields(did = %record.did, cid = %record.cid))]
	async fn append(
		&self,
		record: &OperationRecord,
		expected_head: Option<&Cid>,
	) -> Result<(), StoreError> {
		let operation = serde_json::to_string(&record.operation)?;
		let mut tx = self.db.pool().begin().await?;
		let head: Option<String> = sqlx::query_scalar(
			"SELECT cid FROM operations WHERE did = ? ORDER BY seq DESC LIMIT 1",
		)
		.bind(record.did.as_str())
		.fetch_optional(&mut *tx)
		.await?;
		if head.as_deref() != expected_head.map(Cid::as_str) {
			return Err(StoreError::HeadMismatch {
				did: record.did.clone(),
				expected: expected_head.cloned(),
				found: head.map(|s| Cid::from_str(&s)).transpose().map_err(corrupt)?,
			});
		}
		sqlx::query(
			"INSERT INTO operations (cid, did, operation, created, last_modified)
			VALUES (?, ?, ?, ?, ?)",
		)
		.bind(record.cid.as_str())
		.bind(record.did.as_str())
		.bind(operation)
		.bind(record.created)
		.bind(record.last_modified)
		.execute(&mut *tx)
		.await?;
		tx.commit().await?;
		Ok(())
	}

	#[instrument(skip(self))]
	async fn purge(&self, did: &DidPlc) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM operations WHERE did = ?")
			.bind(did.as_str())
			.execute(self.db.pool())
			.await?;
		Ok(())
	}

	fn list(&self) -> RecordStream<'_, OperationRecord> {
		sqlx::query(SELECT_OPERATION)
			.fetch(self.db.pool())
			.map_err(StoreError::from)
			.and_then(|row| async move { Self::from_row(row) })
			.boxed()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use did_plc::{derive_did, UnsignedOperation};
	use did_simple::crypto::secp256k1::SigningKey;

	async fn memory_db() -> eyre::Result<MigratedDbPool> {
		Ok(MigratedDbPool::connect("sqlite::memory:").await?)
	}

	#[tokio::test]
	async fn test_accounts() -> eyre::Result<()> {
		let store = SqlAccountsStore::new(memory_db().await?);
		let did = DidPlc::from_str("did:plc:ewvi7nxzyoun6zhxrhs64oiz")?;
		let other = DidPlc::from_str("did:plc:z72i7hdynmk6r22z27h6tvur")?;
		let account = Account::new(did.clone(), Handle::parse("alice.example")?);
		store.put(&account).await?;
		assert_eq!(store.get(&did).await?, Some(account.clone()));
		assert_eq!(
			store.get_by_handle(&account.handle).await?,
			Some(account.clone())
		);

		let squatter = Account::new(other, account.handle.clone());
		assert!(matches!(
			store.put(&squatter).await,
			Err(StoreError::Conflict(_))
		));

		let renamed = Account {
			handle: Handle::parse("alice2.example")?,
			..account.clone()
		};
		store.put(&renamed).await?;
		assert_eq!(store.get(&did).await?, Some(renamed.clone()));
		let all: Vec<_> = store.list().try_collect().await?;
		assert_eq!(all, [renamed]);

		store.delete(&did).await?;
		assert_eq!(store.get(&did).await?, None);
		Ok(())
	}

	#[tokio::test]
	async fn test_keys() -> eyre::Result<()> {
		let store = SqlKeysStore::new(memory_db().await?);
		let did = DidPlc::from_str("did:plc:ewvi7nxzyoun6zhxrhs64oiz")?;
		let key = SigningKey::generate()?;
		let record = KeyRecord::new(did.clone(), "atproto", &key);
		store.put(&record).await?;
		store
			.put(&KeyRecord::new(did.clone(), "backup", &SigningKey::generate()?))
			.await?;
		let fetched = store.get(&did, "atproto").await?.expect("key was stored");
		assert_eq!(fetched.signing_key()?.to_bytes(), key.to_bytes());
		assert_eq!(store.list().try_collect::<Vec<_>>().await?.len(), 2);

		store.delete_for_did(&did).await?;
		assert_eq!(store.get(&did, "atproto").await?, None);
		assert_eq!(store.list().try_collect::<Vec<_>>().await?.len(), 0);
		Ok(())
	}

	#[tokio::test]
	async fn test_operations() -> eyre::Result<()> {
		let store = SqlOperationsStore::new(memory_db().await?);
		let key = SigningKey::generate()?;
		let genesis = UnsignedOperation::genesis(
			"alice",
			"https://pds.example",
			DidKey::from(&key.verifying_key()),
		)?
		.sign(&key)?;
		let did = derive_did(&genesis)?;
		let genesis = OperationRecord::new(did.clone(), genesis)?;
		store.append(&genesis, None).await?;
		assert_eq!(store.head(&did).await?, Some(genesis.clone()));

		let tombstone = UnsignedOperation::tombstone(genesis.cid.clone()).sign(&key)?;
		let tombstone = OperationRecord::new(did.clone(), tombstone)?;
		assert!(matches!(
			store.append(&tombstone, None).await,
			Err(StoreError::HeadMismatch { found: Some(_), .. })
		));
		store.append(&tombstone, Some(&genesis.cid)).await?;
		assert_eq!(store.head(&did).await?, Some(tombstone.clone()));
		assert_eq!(store.get(&genesis.cid).await?, Some(genesis.clone()));
		assert_eq!(store.list_for_did(&did).await?, [genesis, tombstone]);

		store.purge(&did).await?;
		assert!(store.list_for_did(&did).await?.is_empty());
		Ok(())
	}
}
