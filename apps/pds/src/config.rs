//! Command line and environment configuration.

use std::time::Duration;

use reqwest::Url;

use crate::store::StoreUris;

pub const DEFAULT_DIRECTORY_URL: &str = "https://plc.directory";

#[derive(clap::Args, Debug, Clone)]
pub struct DirectoryConfig {
	/// Base url of the PLC directory.
	#[clap(long = "directory-url", env = "PLC_DIRECTORY_URL", default_value = DEFAULT_DIRECTORY_URL)]
	pub url: Url,
	/// Seconds to wait for any single directory request.
	#[clap(long, env = "PLC_TIMEOUT_SECS", default_value = "30")]
	pub timeout_secs: u64,
	#[clap(long, env = "PDS_USER_AGENT", default_value = concat!("pds/", env!("CARGO_PKG_VERSION")))]
	pub user_agent: String,
}

impl DirectoryConfig {
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}

	pub fn client(&self) -> Result<reqwest::Client, reqwest::Error> {
		reqwest::Client::builder()
			.timeout(self.timeout())
			.user_agent(&self.user_agent)
			.build()
	}
}

impl Default for DirectoryConfig {
	fn default() -> Self {
		Self {
			url: Url::parse(DEFAULT_DIRECTORY_URL).expect("default url is valid"),
			timeout_secs: 30,
			user_agent: concat!("pds/", env!("CARGO_PKG_VERSION")).to_owned(),
		}
	}
}

/// Where accounts, keys and operations are kept. Each kind of record falls
/// back to `--database-uri` unless it has its own uri.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreConfig {
	#[clap(long, env = "PDS_DATABASE_URI", default_value = "sqlite://pds.db")]
	pub database_uri: String,
	#[clap(long, env = "PDS_ACCOUNTS_URI")]
	pub accounts_uri: Option<String>,
	#[clap(long, env = "PDS_KEYS_URI")]
	pub keys_uri: Option<String>,
	#[clap(long, env = "PDS_OPERATIONS_URI")]
	pub operations_uri: Option<String>,
}

impl StoreConfig {
	pub fn uris(&self) -> StoreUris {
		let or_default = |uri: &Option<String>| {
			uri.clone().unwrap_or_else(|| self.database_uri.clone())
		};
		StoreUris {
			accounts: or_default(&self.accounts_uri),
			keys: or_default(&self.keys_uri),
			operations: or_default(&self.operations_uri),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use clap::Parser;

	#[derive(Parser, Debug)]
	struct Cli {
		#[clap(flatten)]
		directory: DirectoryConfig,
		#[clap(flatten)]
		store: StoreConfig,
	}

	#[test]
	fn test_store_uris_fall_back_to_database() -> eyre::Result<()> {
		let cli = Cli::try_parse_from([
			"pds",
			"--database-uri",
			"sqlite::memory:",
			"--keys-uri",
			"file:///var/lib/pds/keys",
		])?;
		assert_eq!(
			cli.store.uris(),
			StoreUris {
				accounts: "sqlite::memory:".to_owned(),
				keys: "file:///var/lib/pds/keys".to_owned(),
				operations: "sqlite::memory:".to_owned(),
			}
		);
		Ok(())
	}

	#[test]
	fn test_directory_defaults() -> eyre::Result<()> {
		let cli = Cli::try_parse_from(["pds", "--timeout-secs", "5"])?;
		assert_eq!(cli.directory.url, DirectoryConfig::default().url);
		assert_eq!(cli.directory.timeout(), Duration::from_secs(5));
		assert!(cli.directory.user_agent.starts_with("pds/"));
		Ok(())
	}
}
