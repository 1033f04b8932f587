use std::fmt;
use std::path::Path;

use anyhow::Context as _;

/// Space usage of one mounted filesystem.
#[derive(Clone, Copy, Debug)]
pub struct DiskUsage {
	size: u64,
	use_percentage: f32,
}

impl DiskUsage {
	#[allow(clippy::cast_precision_loss, /* not a precise calculation */)]
	pub fn of(disk: &Path) -> anyhow::Result<Self> {
		let raw_stats =
			nix::sys::statvfs::statvfs(disk).with_context(|| format!("statvfs({disk:?})"))?;
		let blocks = raw_stats.blocks();
		anyhow::ensure!(blocks > 0, "{disk:?} reports no blocks");
		let size = blocks * raw_stats.fragment_size();
		let use_percentage = ((blocks - raw_stats.blocks_available()) * 1000 / blocks) as f32 / 10.0;
		Ok(Self {
			size,
			use_percentage,
		})
	}
}

impl fmt::Display for DiskUsage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let size = humansize::SizeFormatter::new(self.size, humansize::BINARY.decimal_places(0));
		write!(f, "{:.1}% of {size} is in use", self.use_percentage)
	}
}
