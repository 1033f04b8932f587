use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::mail::Server;

/// Settings read from the optional JSON config file. Every field has a default.
#[derive(Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub server: String,
	pub port: u16,
	pub subject: String,
	pub signature: String,
	/// File name, inside the work directory, that receives the process list
	/// and is sent as the attachment.
	pub attachment: PathBuf,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			server: "smtp.zoho.com.au".into(),
			port: 587,
			subject: "Server Performance".into(),
			signature: "\nRegards,\nSystem Status.".into(),
			attachment: "running_process.txt".into(),
		}
	}
}

impl Config {
	/// Loads `path`, falling back to defaults when it is missing or invalid.
	pub fn load(path: &Path) -> Self {
		match std::fs::read_to_string(path) {
			Ok(s) => match serde_json::from_str(&s) {
				Ok(config) => config,
				Err(error) => {
					tracing::warn!(?path, %error, "error deserializing config, using defaults");
					Self::default()
				}
			},
			Err(error) => {
				if error.kind() != std::io::ErrorKind::NotFound {
					tracing::warn!(?path, %error, "error reading config, using defaults");
				}
				Self::default()
			}
		}
	}

	pub fn server(&self) -> Server {
		Server {
			host: self.server.clone(),
			port: self.port,
		}
	}
}

/// Sender address and secret, stored as `address,secret` on one line.
#[derive(PartialEq, Eq)]
pub struct Credentials {
	pub address: String,
	pub secret: String,
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("address", &self.address)
			.finish_non_exhaustive()
	}
}

impl std::str::FromStr for Credentials {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (address, secret) = s
			.split_once(',')
			.context("expected `address,secret`")?;
		let (address, secret) = (address.trim(), secret.trim());
		anyhow::ensure!(!address.is_empty(), "sender address is empty");
		anyhow::ensure!(!secret.is_empty(), "sender secret is empty");
		Ok(Self {
			address: address.into(),
			secret: secret.into(),
		})
	}
}

impl Credentials {
	pub fn read(path: &Path) -> anyhow::Result<Self> {
		std::fs::read_to_string(path)
			.with_context(|| format!("reading credentials from {path:?}"))?
			.parse()
			.with_context(|| format!("parsing credentials in {path:?}"))
	}
}
