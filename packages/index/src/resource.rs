use {
	crate::Level,
	strata_database::{self as db, Filter},
};

pub const INTERNAL_ID: &str = "internalId";
pub const PARENT_ID: &str = "parentId";
pub const RESOURCE_TYPE: &str = "resourceType";
pub const PUBLIC_ID: &str = "publicId";
pub const INSTANCE_PUBLIC_ID: &str = "instancePublicId";
pub const SORT_KEY: &str = "sortKey";

/// A stored resource.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
	#[serde(rename = "_id")]
	pub id: i64,

	pub internal_id: i64,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_id: Option<i64>,

	#[serde(rename = "resourceType")]
	pub level: Level,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub public_id: Option<String>,

	#[serde(rename = "0", default)]
	pub collections: Derived,

	#[serde(rename = "1", default)]
	pub groups: Derived,

	#[serde(rename = "2", default)]
	pub subgroups: Derived,

	#[serde(rename = "3", default)]
	pub leaves: Derived,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub instance_public_id: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sort_key: Option<Vec<db::Value>>,
}

/// The state of a derived field.
///
/// A field that is absent or null has not been computed. An array, including the empty array, has been computed.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(from = "Option<Vec<i64>>", into = "Option<Vec<i64>>")]
pub enum Derived {
	#[default]
	NotComputed,
	Computed(Vec<i64>),
}

impl Resource {
	#[must_use]
	pub fn derived(&self, level: Level) -> &Derived {
		match level {
			Level::Collection => &self.collections,
			Level::Group => &self.groups,
			Level::Subgroup => &self.subgroups,
			Level::Leaf => &self.leaves,
		}
	}

	#[must_use]
	pub fn is_pending(&self) -> bool {
		Level::ALL
			.into_iter()
			.any(|level| !self.derived(level).is_computed())
	}
}

impl Derived {
	#[must_use]
	pub fn is_computed(&self) -> bool {
		matches!(self, Self::Computed(_))
	}

	#[must_use]
	pub fn members(&self) -> Option<&[i64]> {
		match self {
			Self::NotComputed => None,
			Self::Computed(members) => Some(members),
		}
	}
}

impl From<Option<Vec<i64>>> for Derived {
	fn from(value: Option<Vec<i64>>) -> Self {
		value.map_or(Self::NotComputed, Self::Computed)
	}
}

impl From<Derived> for Option<Vec<i64>> {
	fn from(value: Derived) -> Self {
		match value {
			Derived::NotComputed => None,
			Derived::Computed(members) => Some(members),
		}
	}
}

/// Matches resources with at least one derived field that has not been computed.
#[must_use]
pub fn pending() -> Filter {
	let filters = Level::ALL
		.into_iter()
		.map(|level| Filter::missing(level.field()))
		.collect();
	Filter::Or(filters)
}

/// Matches the pending resources of a level.
#[must_use]
pub fn pending_at(level: Level) -> Filter {
	Filter::eq(RESOURCE_TYPE, level).and(pending())
}
