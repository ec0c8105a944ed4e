use {
	crate::Level,
	serde_with::{DurationSecondsWithFrac, serde_as},
	std::time::Duration,
	strata_error as se,
};

#[serde_as]
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
	/// The number of units dispatched together. The next group starts only after every unit in the group has finished.
	pub batch_size: usize,

	/// The collection holding the resources.
	pub collection: String,

	/// The number of workers. Each worker holds its own connection.
	pub concurrency: usize,

	/// Whether to create the indexes used by the closure query before sweeping.
	pub create_indexes: bool,

	/// Whether to write `instancePublicId`.
	pub instance_public_id: bool,

	/// Stop after this many cycles even if resources remain pending.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_cycles: Option<u64>,

	/// The collection holding the per resource metadata tags.
	pub metadata_collection: String,

	pub page_size: u64,

	pub pagination: Pagination,

	#[serde_as(as = "DurationSecondsWithFrac")]
	pub query_timeout: Duration,

	pub sort_tags: SortTags,

	#[serde_as(as = "DurationSecondsWithFrac")]
	pub unit_timeout: Duration,

	#[serde_as(as = "DurationSecondsWithFrac")]
	pub write_timeout: Duration,
}

/// How a level's pending resources are split into pages.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pagination {
	/// Each page is a range of identities taken from a snapshot of the pending resources.
	#[default]
	Keyset,

	/// Each page skips the previous pages' resources in the store's natural order.
	Offset,
}

/// The metadata tags joined as the sort key of groups and subgroups.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct SortTags {
	pub group: Vec<Tag>,
	pub subgroup: Vec<Tag>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct Tag {
	pub group: u16,
	pub element: u16,
}

impl Config {
	pub fn validate(&self) -> se::Result<()> {
		if self.page_size == 0 {
			return Err(se::error!("the page size must be positive"));
		}
		if self.batch_size == 0 {
			return Err(se::error!("the batch size must be positive"));
		}
		if self.concurrency == 0 {
			return Err(se::error!("the concurrency must be positive"));
		}
		Ok(())
	}
}

impl SortTags {
	/// The tags joined for a level, or `None` if the level has no sort key.
	#[must_use]
	pub fn get(&self, level: Level) -> Option<&[Tag]> {
		match level {
			Level::Group => Some(&self.group),
			Level::Subgroup => Some(&self.subgroup),
			Level::Collection | Level::Leaf => None,
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			batch_size: 4,
			collection: "Resources".to_owned(),
			concurrency: 4,
			create_indexes: true,
			instance_public_id: true,
			max_cycles: None,
			metadata_collection: "MainDicomTags".to_owned(),
			page_size: 2000,
			pagination: Pagination::default(),
			query_timeout: Duration::from_secs(300),
			sort_tags: SortTags::default(),
			unit_timeout: Duration::from_secs(900),
			write_timeout: Duration::from_secs(300),
		}
	}
}

impl Default for SortTags {
	fn default() -> Self {
		Self {
			group: vec![
				Tag {
					group: 0x0008,
					element: 0x0020,
				},
				Tag {
					group: 0x0008,
					element: 0x0030,
				},
			],
			subgroup: vec![
				Tag {
					group: 0x0008,
					element: 0x0021,
				},
				Tag {
					group: 0x0008,
					element: 0x0031,
				},
			],
		}
	}
}
