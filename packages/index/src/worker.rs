use {
	crate::{
		Config, Event, Index, Level, Unit, closure,
		config::Tag,
		resource::{INSTANCE_PUBLIC_ID, SORT_KEY},
	},
	num::ToPrimitive as _,
	strata_database::{self as db, BulkWriteOutput, Filter, ID, UpdateOne, prelude::*},
	strata_error as se,
};


/// A record output by the closure query.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
	#[serde(rename = "_id")]
	pub id: i64,

	pub internal_id: i64,

	#[serde(rename = "0", default)]
	pub collections: Vec<Member>,

	#[serde(rename = "1", default)]
	pub groups: Vec<Member>,

	#[serde(rename = "2", default)]
	pub subgroups: Vec<Member>,

	#[serde(rename = "3", default)]
	pub leaves: Vec<Member>,

	#[serde(default)]
	pub sorts: Option<Vec<SortTag>>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
	pub internal_id: i64,

	#[serde(default)]
	pub public_id: Option<String>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortTag {
	pub tag_group: u16,
	pub tag_element: u16,
	#[serde(default)]
	pub value: db::Value,
}

/// The fields written onto a resource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
	pub levels: [Vec<i64>; 4],
	pub instance_public_id: Option<String>,
	pub sort_key: Option<Vec<db::Value>>,
}

/// The output of a unit.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Output {
	pub level: Level,
	pub page: u64,
	pub requests: u64,
	pub output: BulkWriteOutput,
}

impl Record {
	#[must_use]
	pub fn members(&self, level: Level) -> &[Member] {
		match level {
			Level::Collection => &self.collections,
			Level::Group => &self.groups,
			Level::Subgroup => &self.subgroups,
			Level::Leaf => &self.leaves,
		}
	}
}

/// Compute the fields to write for a closure record.
#[must_use]
pub fn project(config: &Config, level: Level, record: &Record) -> Update {
	let levels = Level::ALL.map(|level| {
		record
			.members(level)
			.iter()
			.map(|member| member.internal_id)
			.collect()
	});

	let instance_public_id = if config.instance_public_id {
		record
			.leaves
			.first()
			.and_then(|member| member.public_id.clone())
	} else {
		None
	};

	let sort_key = config
		.sort_tags
		.get(level)
		.map(|tags| sort_key(tags, record.sorts.as_deref().unwrap_or_default()));

	Update {
		levels,
		instance_public_id,
		sort_key,
	}
}

/// Order the joined tag values as in the tag table. Tags without a value are omitted.
fn sort_key(tags: &[Tag], sorts: &[SortTag]) -> Vec<db::Value> {
	tags.iter()
		.flat_map(|tag| {
			sorts.iter().filter(move |sort| {
				sort.tag_group == tag.group && sort.tag_element == tag.element
			})
		})
		.map(|sort| sort.value.clone())
		.collect()
}

impl Update {
	/// The update of the resource with the given identity.
	#[must_use]
	pub fn to_operation(&self, id: i64) -> UpdateOne {
		let mut set = db::Document::new();
		for level in Level::ALL {
			let members = self.levels[level.index()]
				.iter()
				.copied()
				.map(db::Value::from)
				.collect();
			set.insert(level.field().to_owned(), db::Value::Array(members));
		}
		if let Some(instance_public_id) = &self.instance_public_id {
			set.insert(
				INSTANCE_PUBLIC_ID.to_owned(),
				db::Value::String(instance_public_id.clone()),
			);
		}
		if let Some(sort_key) = &self.sort_key {
			set.insert(SORT_KEY.to_owned(), db::Value::Array(sort_key.clone()));
		}
		UpdateOne {
			filter: Filter::eq(ID, id),
			set,
		}
	}
}

impl<D> Index<D>
where
	D: db::Database + Send + Sync + 'static,
{
	/// Compute and write the closures of a unit's resources with one bulk write.
	#[tracing::instrument(level = "debug", skip_all, fields(level = %unit.level, page = unit.page))]
	pub(crate) async fn run_unit(
		&self,
		connection: &D::Connection,
		unit: &Unit,
	) -> se::Result<Output> {
		// Query the closures.
		let pipeline = closure::query(&self.config, unit);
		let records = tokio::time::timeout(
			self.config.query_timeout,
			connection.aggregate_into::<Record>(&self.config.collection, &pipeline),
		)
		.await
		.map_err(|source| se::error!(!source, "the closure query timed out"))?
		.map_err(|source| se::error!(!source, "failed to query the closures"))?;

		// Project the updates.
		let operations = records
			.iter()
			.map(|record| project(&self.config, unit.level, record).to_operation(record.id))
			.collect::<Vec<_>>();
		let requests = operations.len().to_u64().unwrap_or_default();
		self.publish(Event::Write {
			level: unit.level,
			page: unit.page,
			requests,
		});

		// Write the updates.
		let output = if operations.is_empty() {
			BulkWriteOutput::default()
		} else {
			tokio::time::timeout(
				self.config.write_timeout,
				connection.bulk_write(&self.config.collection, operations),
			)
			.await
			.map_err(|source| se::error!(!source, "the bulk write timed out"))?
			.map_err(|source| se::error!(!source, "failed to write the closures"))?
		};
		if output.is_partial_failure() {
			tracing::warn!(
				level = %unit.level,
				page = unit.page,
				errors = output.write_errors.len(),
				"the bulk write partially failed"
			);
		} else {
			tracing::debug!(
				matched = output.matched,
				modified = output.modified,
				"wrote the closures"
			);
		}
		self.publish(Event::Written {
			level: unit.level,
			page: unit.page,
			output: output.clone(),
		});

		Ok(Output {
			level: unit.level,
			page: unit.page,
			requests,
			output,
		})
	}
}
