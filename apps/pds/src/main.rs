use std::sync::Arc;

use clap::Parser as _;
use color_eyre::{eyre::WrapErr as _, Section as _};
use did_plc::{DidPlc, Handle};
use did_simple::crypto::secp256k1::SigningKey;
use pds::{
	config::{DirectoryConfig, StoreConfig},
	handle_resolver::resolve_handle,
	store::{Registries, Stores},
	DeleteOptions, IdentityManager, PlcDirectory,
};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(clap::Parser, Debug)]
#[clap(version, about)]
struct Cli {
	/// Log at debug level unless RUST_LOG says otherwise.
	#[clap(long, short, global = true)]
	verbose: bool,
	#[clap(flatten)]
	directory: DirectoryConfig,
	#[clap(flatten)]
	store: StoreConfig,
	#[clap(subcommand)]
	command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
	/// Creates an identity and an account for it.
	CreateAccount {
		handle: String,
		/// Url of the PDS that hosts the account.
		#[clap(long, env = "PDS_SERVICE_ENDPOINT")]
		service_endpoint: Url,
	},
	/// Tombstones an account's identity and forgets its keys.
	DeleteAccount {
		did: DidPlc,
		/// Also erase the local copy of the operation log.
		#[clap(long)]
		erase_operations: bool,
	},
	ListAccounts,
	UpdateHandle {
		did: DidPlc,
		handle: String,
	},
	/// Brings local state in line with the directory.
	Reconcile {
		did: DidPlc,
	},
	/// Creates an identity without storing anything, printing its private key.
	CreateDid {
		handle: String,
		#[clap(long, env = "PDS_SERVICE_ENDPOINT")]
		service_endpoint: Url,
	},
	/// Tombstones an identity with a multibase encoded private key.
	TombstoneDid {
		did: DidPlc,
		#[clap(long, env = "PLC_PRIVATE_KEY", hide_env_values = true)]
		private_key: String,
	},
	ResolveDid {
		did: DidPlc,
	},
	ResolveHandle {
		handle: Handle,
		/// Url of the PDS to ask.
		#[clap(long)]
		service: Url,
	},
}

impl Command {
	fn needs_stores(&self) -> bool {
		!matches!(
			self,
			Self::CreateDid { .. } | Self::ResolveDid { .. } | Self::ResolveHandle { .. }
		)
	}
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;
	let cli = Cli::parse();
	let default_filter = if cli.verbose { "debug" } else { "info" };
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or(default_filter.into()))
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
		.init();

	let cancel = CancellationToken::new();
	tokio::spawn({
		let cancel = cancel.clone();
		async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				warn!("interrupted, cancelling");
				cancel.cancel();
			}
		}
	});

	let client = cli
		.directory
		.client()
		.wrap_err("failed to build http client")?;
	let directory = Arc::new(PlcDirectory::with_client(
		client.clone(),
		cli.directory.url.clone(),
	));
	let stores = if cli.command.needs_stores() {
		let uris = cli.store.uris();
		let registries =
			Registries::with_default_backends().wrap_err("failed to register stores")?;
		registries
			.open(&uris)
			.await
			.wrap_err("failed to open stores")
			.with_note(|| format!("store uris were {uris:?}"))?
	} else {
		Stores::null()
	};
	let manager = IdentityManager::new(directory, stores);

	match cli.command {
		Command::CreateAccount {
			handle,
			service_endpoint,
		} => {
			let endpoint = service_endpoint.as_str().trim_end_matches('/');
			let created = manager.create_account(&handle, endpoint, &cancel).await?;
			println!("{}", created.account.did);
		}
		Command::DeleteAccount {
			did,
			erase_operations,
		} => {
			let deleted = manager
				.delete_account(&did, DeleteOptions { erase_operations }, &cancel)
				.await?;
			info!(cid = %deleted.tombstone.cid, "tombstone accepted");
		}
		Command::ListAccounts => {
			for account in manager.list_accounts().await? {
				println!("{}\t{}", account.did, account.handle);
			}
		}
		Command::UpdateHandle { did, handle } => {
			let account = manager.update_handle(&did, &handle, &cancel).await?;
			println!("{}\t{}", account.did, account.handle);
		}
		Command::Reconcile { did } => {
			let report = manager.reconcile(&did).await?;
			println!(
				"appended {} operations, tombstoned: {}",
				report.appended.len(),
				report.tombstoned
			);
		}
		Command::CreateDid {
			handle,
			service_endpoint,
		} => {
			let endpoint = service_endpoint.as_str().trim_end_matches('/');
			let created = manager.create_account(&handle, endpoint, &cancel).await?;
			println!("{}", created.account.did);
			println!("{}", created.key.private_key);
		}
		Command::TombstoneDid { did, private_key } => {
			let key = SigningKey::from_multibase(&private_key)
				.wrap_err("invalid private key")?;
			let tombstone = manager.tombstone_did(&did, &key, &cancel).await?;
			info!(cid = %tombstone.cid, "tombstone accepted");
		}
		Command::ResolveDid { did } => {
			let doc = manager.resolve_did(&did).await?;
			println!("{}", serde_json::to_string_pretty(&doc)?);
		}
		Command::ResolveHandle { handle, service } => {
			let did = resolve_handle(&client, &service, &handle).await?;
			println!("{did}");
		}
	}
	Ok(())
}
