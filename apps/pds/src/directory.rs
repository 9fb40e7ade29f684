//! The PLC directory: the remote registry that orders and publishes every
//! operation of every `did:plc` identifier.

use std::{
	collections::HashMap,
	fmt::Debug,
	sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use did_plc::{
	document::DidDocument, ChainValidator, DidPlc, SignedOperation, UnsignedOperation,
};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::DirectoryConfig;

#[async_trait]
pub trait Directory: Debug + Send + Sync + 'static {
	/// Submits `op` as the next operation of `did`. Returns once the directory
	/// has accepted it.
	async fn submit(&self, did: &DidPlc, op: &SignedOperation)
		-> Result<(), DirectoryError>;

	/// The current DID document of `did`.
	async fn resolve(&self, did: &DidPlc) -> Result<DidDocument, DirectoryError>;

	/// Every operation of `did`, oldest first.
	async fn op_log(&self, did: &DidPlc) -> Result<Vec<SignedOperation>, DirectoryError>;
}

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
	#[error("failed to reach the directory")]
	Transport(#[source] reqwest::Error),
	#[error("request to the directory timed out")]
	Timeout(#[source] reqwest::Error),
	#[error("the directory rejected the request ({status}): {message}")]
	Rejected { status: u16, message: String },
	#[error("{0} is not known to the directory")]
	NotFound(DidPlc),
	#[error("unexpected response from the directory")]
	Decode(#[from] serde_json::Error),
	#[error("invalid directory url")]
	Url(#[from] url::ParseError),
}

impl DirectoryError {
	/// Whether the same request may succeed later.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Transport(_) | Self::Timeout(_) => true,
			Self::Rejected { status, .. } => {
				*status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
			}
			Self::NotFound(_) | Self::Decode(_) | Self::Url(_) => false,
		}
	}
}

impl From<reqwest::Error> for DirectoryError {
	fn from(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			Self::Timeout(err)
		} else {
			Self::Transport(err)
		}
	}
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
	message: String,
}

/// Talks to a directory over HTTP.
#[derive(Debug, Clone)]
pub struct PlcDirectory {
	client: reqwest::Client,
	url: Url,
}

impl PlcDirectory {
	pub fn new(config: &DirectoryConfig) -> Result<Self, reqwest::Error> {
		Ok(Self::with_client(config.client()?, config.url.clone()))
	}

	pub fn with_client(client: reqwest::Client, url: Url) -> Self {
		Self { client, url }
	}

	pub fn url(&self) -> &Url {
		&self.url
	}

	/// `{url}/{did}` followed by `segments`. The DID is pushed as a path
	/// segment, since joining it would parse `did:` as a scheme.
	fn endpoint(&self, did: &DidPlc, segments: &[&str]) -> Result<Url, DirectoryError> {
		let mut url = self.url.clone();
		url.path_segments_mut()
			.map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
			.pop_if_empty()
			.push(did.as_str())
			.extend(segments);
		Ok(url)
	}

	/// Passes successful responses through and turns the rest into errors.
	async fn check(
		did: &DidPlc,
		response: reqwest::Response,
	) -> Result<reqwest::Response, DirectoryError> {
		let status = response.status();
		if status.is_success() {
			return Ok(response);
		}
		if status == StatusCode::NOT_FOUND {
			return Err(DirectoryError::NotFound(did.clone()));
		}
		let body = response.bytes().await?;
		let message = serde_json::from_slice::<ErrorBody>(&body)
			.map(|body| body.message)
			.unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
		Err(DirectoryError::Rejected {
			status: status.as_u16(),
			message,
		})
	}
}

#[async_trait]
impl Directory for PlcDirectory {
	#[instrument(skip_all, fields(%did, kind = %op.kind()))]
	async fn submit(
		&self,
		did: &DidPlc,
		op: &SignedOperation,
	) -> Result<(), DirectoryError> {
		let url = self.endpoint(did, &[])?;
		let response = self.client.post(url).json(op).send().await?;
		Self::check(did, response).await?;
		debug!("directory accepted operation");
		Ok(())
	}

	#[instrument(skip(self), fields(%did))]
	async fn resolve(&self, did: &DidPlc) -> Result<DidDocument, DirectoryError> {
		let url = self.endpoint(did, &[])?;
		let response = Self::check(did, self.client.get(url).send().await?).await?;
		Ok(serde_json::from_slice(&response.bytes().await?)?)
	}

	#[instrument(skip(self), fields(%did))]
	async fn op_log(&self, did: &DidPlc) -> Result<Vec<SignedOperation>, DirectoryError> {
		let url = self.endpoint(did, &["log"])?;
		let response = Self::check(did, self.client.get(url).send().await?).await?;
		Ok(serde_json::from_slice(&response.bytes().await?)?)
	}
}

#[derive(Debug)]
struct Log {
	validator: ChainValidator,
	ops: Vec<SignedOperation>,
}

/// A directory that lives in process memory. It validates submissions the
/// same way a real directory does, so it can stand in for one in tests and
/// local development.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
	logs: Mutex<HashMap<DidPlc, Log>>,
	unavailable: AtomicBool,
}

impl InMemoryDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	/// While set, every request fails with a 503.
	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	fn check_available(&self) -> Result<(), DirectoryError> {
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(DirectoryError::Rejected {
				status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
				message: "directory is unavailable".to_owned(),
			});
		}
		Ok(())
	}
}

#[async_trait]
impl Directory for InMemoryDirectory {
	async fn submit(
		&self,
		did: &DidPlc,
		op: &SignedOperation,
	) -> Result<(), DirectoryError> {
		self.check_available()?;
		let mut logs = self.logs.lock().await;
		let log = logs.entry(did.clone()).or_insert_with(|| Log {
			validator: ChainValidator::new(did.clone()),
			ops: Vec::new(),
		});
		match log.validator.apply(op) {
			Ok(_) => {
				log.ops.push(op.clone());
				Ok(())
			}
			Err(err) => {
				warn!(%did, "rejected operation: {err}");
				if log.ops.is_empty() {
					logs.remove(did);
				}
				Err(DirectoryError::Rejected {
					status: StatusCode::BAD_REQUEST.as_u16(),
					message: err.to_string(),
				})
			}
		}
	}

	async fn resolve(&self, did: &DidPlc) -> Result<DidDocument, DirectoryError> {
		self.check_available()?;
		let logs = self.logs.lock().await;
		let log = logs
			.get(did)
			.ok_or_else(|| DirectoryError::NotFound(did.clone()))?;
		match log.ops.last().map(|op| &op.op) {
			Some(UnsignedOperation::Regular(regular)) => {
				Ok(DidDocument::from_operation(did, regular))
			}
			Some(UnsignedOperation::Tombstone(_)) => Err(DirectoryError::Rejected {
				status: StatusCode::GONE.as_u16(),
				message: format!("DID not available: {did}"),
			}),
			None => Err(DirectoryError::NotFound(did.clone())),
		}
	}

	async fn op_log(&self, did: &DidPlc) -> Result<Vec<SignedOperation>, DirectoryError> {
		self.check_available()?;
		self.logs
			.lock()
			.await
			.get(did)
			.map(|log| log.ops.clone())
			.ok_or_else(|| DirectoryError::NotFound(did.clone()))
	}
}
