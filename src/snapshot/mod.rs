//! Local system diagnostics gathered into the mail body and attachment.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context as _;

pub mod disk;

pub use disk::DiskUsage;

pub const CPU_INFO_FILE: &str = "cpu_info.txt";
pub const MEM_INFO_FILE: &str = "mem_info.txt";

const CPU_HEADING: &str = "*************** CPU INFO ***************\n";
const MEM_HEADING: &str = "*************** MEMORY USAGE INFO ***************\n";

/// One point-in-time view of the host.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
	pub cpu_info: String,
	pub mem_info: String,
	pub processes: String,
	pub disk: Option<String>,
}

impl Snapshot {
	/// Mail body: CPU info followed by memory info, each under a heading.
	pub fn body(&self) -> String {
		let mut body = String::with_capacity(
			CPU_HEADING.len() + self.cpu_info.len() + MEM_HEADING.len() + self.mem_info.len(),
		);
		body.push_str(CPU_HEADING);
		body.push_str(&self.cpu_info);
		body.push_str(MEM_HEADING);
		body.push_str(&self.mem_info);
		if let Some(disk) = &self.disk {
			if !body.ends_with('\n') {
				body.push('\n');
			}
			body.push_str(disk);
			body.push('\n');
		}
		body
	}

	/// Writes each section to its own file in `dir`, returning the path of
	/// the process list.
	pub fn write_to(&self, dir: &Path, processes_file: &Path) -> anyhow::Result<PathBuf> {
		std::fs::create_dir_all(dir).with_context(|| format!("creating {dir:?}"))?;
		for (name, contents) in [
			(Path::new(CPU_INFO_FILE), &self.cpu_info),
			(Path::new(MEM_INFO_FILE), &self.mem_info),
			(processes_file, &self.processes),
		] {
			let path = dir.join(name);
			std::fs::write(&path, contents).with_context(|| format!("writing {path:?}"))?;
		}
		Ok(dir.join(processes_file))
	}
}

pub trait SnapshotProvider {
	fn snapshot(&self) -> anyhow::Result<Snapshot>;
}

/// Reads `/proc`, lists processes with `ps` and measures the root filesystem.
pub struct ProcSnapshot {
	proc_root: PathBuf,
	disk: PathBuf,
}

impl ProcSnapshot {
	pub fn new() -> Self {
		Self {
			proc_root: "/proc".into(),
			disk: "/".into(),
		}
	}

	fn read(&self, name: &str) -> anyhow::Result<String> {
		let path = self.proc_root.join(name);
		std::fs::read_to_string(&path).with_context(|| format!("reading {path:?}"))
	}

	fn processes() -> anyhow::Result<String> {
		let output = Command::new("ps")
			.arg("aux")
			.output()
			.context("spawning ps")?;
		anyhow::ensure!(output.status.success(), "ps exited with non-zero status");
		String::from_utf8(output.stdout).context("decoding ps output")
	}
}

impl Default for ProcSnapshot {
	fn default() -> Self {
		Self::new()
	}
}

impl SnapshotProvider for ProcSnapshot {
	fn snapshot(&self) -> anyhow::Result<Snapshot> {
		let disk = match DiskUsage::of(&self.disk) {
			Ok(usage) => Some(format!("{usage} on {:?}", self.disk)),
			Err(error) => {
				tracing::warn!(%error, "skipping disk usage");
				None
			}
		};

		Ok(Snapshot {
			cpu_info: self.read("cpuinfo")?,
			mem_info: self.read("meminfo")?,
			processes: Self::processes()?,
			disk,
		})
	}
}
