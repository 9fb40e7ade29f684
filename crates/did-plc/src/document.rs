//! DID documents, as served by a directory for `GET /{did}`.

use did_simple::methods::plc::DidPlc;
use serde::{Deserialize, Serialize};

use crate::operation::RegularOp;

pub const DID_CONTEXT: &str = "https://www.w3.org/ns/did/v1";
pub const MULTIKEY_CONTEXT: &str = "https://w3id.org/security/multikey/v1";
pub const SECP256K1_CONTEXT: &str = "https://w3id.org/security/suites/secp256k1-2019/v1";

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
	#[serde(rename = "@context", default)]
	pub context: Vec<String>,
	pub id: DidPlc,
	#[serde(default)]
	pub also_known_as: Vec<String>,
	#[serde(default)]
	pub verification_method: Vec<VerificationMethod>,
	#[serde(default)]
	pub service: Vec<DocumentService>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub controller: String,
	pub public_key_multibase: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentService {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub service_endpoint: String,
}

impl DidDocument {
	/// Renders the document for `did` whose latest operation is `op`.
	pub fn from_operation(did: &DidPlc, op: &RegularOp) -> Self {
		let verification_method = op
			.verification_methods
			.iter()
			.map(|(name, key)| VerificationMethod {
				id: format!("{did}#{name}"),
				kind: "Multikey".to_owned(),
				controller: did.to_string(),
				public_key_multibase: key.multibase().to_owned(),
			})
			.collect();
		let service = op
			.services
			.iter()
			.map(|(name, service)| DocumentService {
				id: format!("#{name}"),
				kind: service.kind.clone(),
				service_endpoint: service.endpoint.clone(),
			})
			.collect();
		Self {
			context: [DID_CONTEXT, MULTIKEY_CONTEXT, SECP256K1_CONTEXT]
				.map(String::from)
				.to_vec(),
			id: did.clone(),
			also_known_as: op.also_known_as.clone(),
			verification_method,
			service,
		}
	}

	/// The endpoint of the `#atproto_pds` service.
	pub fn pds_endpoint(&self) -> Option<&str> {
		self.service
			.iter()
			.find(|s| s.id.ends_with("#atproto_pds"))
			.map(|s| s.service_endpoint.as_str())
	}
}
