use {num::ToPrimitive as _, strata_error as se};

/// The depth class of a resource in the tree.
#[derive(
	Clone,
	Copy,
	Debug,
	Eq,
	Hash,
	Ord,
	PartialEq,
	PartialOrd,
	num_derive::FromPrimitive,
	num_derive::ToPrimitive,
	serde::Deserialize,
	serde::Serialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Level {
	Collection = 0,
	Group = 1,
	Subgroup = 2,
	Leaf = 3,
}

impl Level {
	pub const ALL: [Self; 4] = [Self::Collection, Self::Group, Self::Subgroup, Self::Leaf];

	/// The name of the derived field holding the closure members of this level.
	#[must_use]
	pub fn field(self) -> &'static str {
		match self {
			Self::Collection => "0",
			Self::Group => "1",
			Self::Subgroup => "2",
			Self::Leaf => "3",
		}
	}

	#[must_use]
	pub fn parent(self) -> Option<Self> {
		match self {
			Self::Collection => None,
			Self::Group => Some(Self::Collection),
			Self::Subgroup => Some(Self::Group),
			Self::Leaf => Some(Self::Subgroup),
		}
	}

	#[must_use]
	pub fn index(self) -> usize {
		self.to_usize().unwrap_or_default()
	}
}

impl From<Level> for u8 {
	fn from(value: Level) -> Self {
		value.to_u8().unwrap_or_default()
	}
}

impl TryFrom<u8> for Level {
	type Error = se::Error;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		num::FromPrimitive::from_u8(value)
			.ok_or_else(|| se::error!(%value, "invalid resource type"))
	}
}

impl From<Level> for strata_database::Value {
	fn from(value: Level) -> Self {
		u8::from(value).into()
	}
}

impl std::fmt::Display for Level {
	fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Collection => write!(formatter, "collection"),
			Self::Group => write!(formatter, "group"),
			Self::Subgroup => write!(formatter, "subgroup"),
			Self::Leaf => write!(formatter, "leaf"),
		}
	}
}

impl std::str::FromStr for Level {
	type Err = se::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"collection" | "0" => Ok(Self::Collection),
			"group" | "1" => Ok(Self::Group),
			"subgroup" | "2" => Ok(Self::Subgroup),
			"leaf" | "3" => Ok(Self::Leaf),
			_ => Err(se::error!(%level = s, "invalid level")),
		}
	}
}
