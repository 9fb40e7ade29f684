//! Resolves handles to DIDs through a PDS's XRPC endpoint.

use did_plc::{DidPlc, Handle};
use reqwest::Url;
use serde::Deserialize;
use tracing::instrument;

pub const RESOLVE_HANDLE_PATH: [&str; 2] = ["xrpc", "com.atproto.identity.resolveHandle"];

#[derive(thiserror::Error, Debug)]
pub enum ResolveHandleError {
	#[error("failed to reach {0}")]
	Transport(Url, #[source] reqwest::Error),
	#[error("{service} could not resolve {handle} ({status})")]
	Status {
		service: Url,
		handle: Handle,
		status: u16,
	},
	#[error("unexpected response from {0}")]
	Decode(Url, #[source] serde_json::Error),
	#[error("{0} cannot be used as a base url")]
	Url(Url),
}

#[derive(Deserialize, Debug)]
struct Resolved {
	did: DidPlc,
}

/// The query url under `service`, which may itself carry a path.
fn endpoint(service: &Url, handle: &Handle) -> Result<Url, ResolveHandleError> {
	let mut url = service.clone();
	url.path_segments_mut()
		.map_err(|()| ResolveHandleError::Url(service.clone()))?
		.pop_if_empty()
		.extend(RESOLVE_HANDLE_PATH);
	url.query_pairs_mut().append_pair("handle", handle.as_str());
	Ok(url)
}

/// Asks `service` which DID `handle` belongs to.
#[instrument(skip(client), fields(%service, %handle))]
pub async fn resolve_handle(
	client: &reqwest::Client,
	service: &Url,
	handle: &Handle,
) -> Result<DidPlc, ResolveHandleError> {
	let url = endpoint(service, handle)?;
	let transport = |err| ResolveHandleError::Transport(service.clone(), err);
	let response = client.get(url).send().await.map_err(transport)?;
	let status = response.status();
	if !status.is_success() {
		return Err(ResolveHandleError::Status {
			service: service.clone(),
			handle: handle.clone(),
			status: status.as_u16(),
		});
	}
	let body = response.bytes().await.map_err(transport)?;
	let resolved: Resolved = serde_json::from_slice(&body)
		.map_err(|err| ResolveHandleError::Decode(service.clone(), err))?;
	Ok(resolved.did)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_endpoint_keeps_service_path() -> eyre::Result<()> {
		let handle = Handle::parse("alice.example")?;
		let cases = [
			("https://host", "https://host/xrpc/com.atproto.identity.resolveHandle"),
			("https://host/", "https://host/xrpc/com.atproto.identity.resolveHandle"),
			("https://host/pds", "https://host/pds/xrpc/com.atproto.identity.resolveHandle"),
			("https://host/pds/", "https://host/pds/xrpc/com.atproto.identity.resolveHandle"),
		];
		for (service, expected) in cases {
			let url = endpoint(&service.parse()?, &handle)?;
			assert_eq!(url.as_str(), format!("{expected}?handle=alice.example"));
		}

		let opaque: Url = "mailto:pds@host".parse()?;
		assert!(matches!(
			endpoint(&opaque, &handle),
			Err(ResolveHandleError::Url(url)) if url == opaque
		));
		Ok(())
	}
}
