//! Stores that accept every write and never return anything. Useful for
//! one-shot commands where only the directory matters.

use async_trait::async_trait;
use did_plc::{Cid, DidPlc, Handle};
use futures::stream;
use futures::StreamExt as _;

use super::{
	Account, AccountsStore, KeyRecord, KeysStore, OperationRecord, OperationsStore,
	RecordStream, StoreError,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl AccountsStore for NullStore {
	async fn get(&self, _did: &DidPlc) -> Result<Option<Account>, StoreError> {
		Ok(None)
	}

	async fn get_by_handle(&self, _handle: &Handle) -> Result<Option<Account>, StoreError> {
		Ok(None)
	}

	async fn put(&self, _account: &Account) -> Result<(), StoreError> {
		Ok(())
	}

	async fn delete(&self, _did: &DidPlc) -> Result<(), StoreError> {
		Ok(())
	}

	fn list(&self) -> RecordStream<'_, Account> {
		stream::empty().boxed()
	}
}

#[async_trait]
impl KeysStore for NullStore {
	async fn get(&self, _did: &DidPlc, _label: &str) -> Result<Option<KeyRecord>, StoreError> {
		Ok(None)
	}

	async fn put(&self, _key: &KeyRecord) -> Result<(), StoreError> {
		Ok(())
	}

	async fn delete(&self, _did: &DidPlc, _label: &str) -> Result<(), StoreError> {
		Ok(())
	}

	async fn delete_for_did(&self, _did: &DidPlc) -> Result<(), StoreError> {
		Ok(())
	}

	fn list(&self) -> RecordStream<'_, KeyRecord> {
		stream::empty().boxed()
	}
}

#[async_trait]
impl OperationsStore for NullStore {
	async fn get(&self, _cid: &Cid) -> Result<Option<OperationRecord>, StoreError> {
		Ok(None)
	}

	async fn head(&self, _did: &DidPlc) -> Result<Option<OperationRecord>, StoreError> {
		Ok(None)
	}

	async fn list_for_did(&self, _did: &DidPlc) -> Result<Vec<OperationRecord>, StoreError> {
		Ok(Vec::new())
	}

	/// Nothing is ever stored, so there is no head to check against.
	async fn append(
		&self,
		_record: &OperationRecord,
		_expected_head: Option<&Cid>,
	) -> Result<(), StoreError> {
		Ok(())
	}

	async fn purge(&self, _did: &DidPlc) -> Result<(), StoreError> {
		Ok(())
	}

	fn list(&self) -> RecordStream<'_, OperationRecord> {
		stream::empty().boxed()
	}
}
