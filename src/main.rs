#![deny(
	absolute_paths_not_starting_with_crate,
	keyword_idents,
	macro_use_extern_crate,
	meta_variable_misuse,
	missing_abi,
	non_ascii_idents,
	nonstandard_style,
	noop_method_call,
	rust_2018_idioms,
	unused_qualifications
)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use snapshot_mail::config::{Config, Credentials};
use snapshot_mail::mail::MailComposer;
use snapshot_mail::snapshot::{ProcSnapshot, SnapshotProvider};

enum Output {
	Mail,
	Stdout,
}

impl std::str::FromStr for Output {
	type Err = &'static str;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"mail" => Self::Mail,
			"stdout" => Self::Stdout,
			_ => return Err("valid outputs are `mail` and `stdout`"),
		})
	}
}

/// Mail a snapshot of CPU, memory and process information.
#[derive(argh::FromArgs)]
struct Args {
	/// where to deliver the snapshot, `mail` (default) or `stdout`
	#[argh(option, default = "Output::Mail")]
	output: Output,
	/// JSON config file
	#[argh(option, default = "PathBuf::from(\"snapshot-mail.json\")")]
	config: PathBuf,
	/// file holding `address,secret` of the sender
	#[argh(option, default = "PathBuf::from(\"Credentials.txt\")")]
	credentials: PathBuf,
	/// recipient address, defaults to the sender
	#[argh(option)]
	recipient: Option<String>,
	/// directory the diagnostics files are written to
	#[argh(option, default = "PathBuf::from(\".\")")]
	workdir: PathBuf,
}

fn init_logging() {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();
}

fn run(args: Args) -> anyhow::Result<()> {
	let config = Config::load(&args.config);
	let credentials = Credentials::read(&args.credentials)?;
	let recipient = args
		.recipient
		.unwrap_or_else(|| credentials.address.clone());

	let snapshot = ProcSnapshot::new()
		.snapshot()
		.context("gathering diagnostics")?;
	let attachment = snapshot.write_to(&args.workdir, &config.attachment)?;

	let mut composer =
		MailComposer::new(config.server(), &credentials.address, &credentials.secret)
			.context("setting up mail")?;
	let parts = [
		composer.set_subject(&config.subject),
		composer.set_body(&snapshot.body()),
		composer.set_signature(&config.signature),
		composer.add_attachment(&attachment),
	];
	for error in parts.into_iter().filter_map(Result::err) {
		tracing::warn!(%error, "part left out");
	}

	match args.output {
		Output::Mail => {
			composer.send(&recipient).context("sending mail")?;
			eprintln!("mail was sent successfully to {recipient}");
		}
		Output::Stdout => {
			let message = composer.preview(&recipient).context("composing mail")?;
			std::io::stdout()
				.write_all(&message)
				.context("writing to stdout")?;
		}
	}

	Ok(())
}

fn main() -> ExitCode {
	init_logging();
	let args: Args = argh::from_env();

	match run(args) {
		Ok(()) => ExitCode::SUCCESS,
		Err(error) => {
			tracing::error!("{error:#}");
			ExitCode::FAILURE
		}
	}
}
