use {
	crate::{
		Config, Level,
		resource::{self, INTERNAL_ID, PARENT_ID, RESOURCE_TYPE},
	},
	strata_database::{self as db, Expression, Filter, GraphLookup, ID, Lookup, Stage},
};

pub const SELF: &str = "self";
pub const DESCENDANTS: &str = "descendants";
pub const ANCESTORS: &str = "ancestors";
pub const CLOSURE: &str = "closure";
pub const SORTS: &str = "sorts";

/// A page of the pending resources of a level.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Unit {
	pub level: Level,

	/// The page number, starting at one.
	pub page: u64,

	pub bounds: Bounds,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Bounds {
	/// The resources with identities in `start..end`.
	Keys { start: i64, end: i64 },

	/// The resources after the first `skip`, at most `limit` of them.
	Offset { skip: u64, limit: u64 },
}

/// Build the query that computes the closure of each pending resource in a unit.
///
/// The closure of a resource is the resource itself, followed by its descendants, followed by its ancestors. Each record has the resource's `_id` and `internalId`, and one field per level holding the closure members of that level. Groups and subgroups also have a `sorts` field holding their sort tags.
#[must_use]
pub fn query(config: &Config, unit: &Unit) -> Vec<Stage> {
	let mut pipeline = Vec::new();

	// Select the page.
	let mut filter = resource::pending_at(unit.level);
	match unit.bounds {
		Bounds::Keys { start, end } => {
			filter = filter
				.and(Filter::Gte(ID.to_owned(), start.into()))
				.and(Filter::Lt(ID.to_owned(), end.into()));
			pipeline.push(Stage::Match(filter));
		},
		Bounds::Offset { skip, limit } => {
			pipeline.push(Stage::Match(filter));
			pipeline.push(Stage::Skip(skip));
			pipeline.push(Stage::Limit(limit));
		},
	}

	// Expand each resource into its closure.
	pipeline.push(Stage::AddFields(vec![(SELF.to_owned(), Expression::Root)]));
	pipeline.push(Stage::GraphLookup(GraphLookup {
		from: config.collection.clone(),
		start_with: Expression::field(INTERNAL_ID),
		connect_from_field: INTERNAL_ID.to_owned(),
		connect_to_field: PARENT_ID.to_owned(),
		output: DESCENDANTS.to_owned(),
	}));
	pipeline.push(Stage::GraphLookup(GraphLookup {
		from: config.collection.clone(),
		start_with: Expression::field(PARENT_ID),
		connect_from_field: PARENT_ID.to_owned(),
		connect_to_field: INTERNAL_ID.to_owned(),
		output: ANCESTORS.to_owned(),
	}));
	let empty = || Box::new(Expression::Literal(db::Value::Array(Vec::new())));
	pipeline.push(Stage::AddFields(vec![(
		CLOSURE.to_owned(),
		Expression::ConcatArrays(vec![
			Expression::Array(vec![Expression::field(SELF)]),
			Expression::IfNull(Box::new(Expression::field(DESCENDANTS)), empty()),
			Expression::IfNull(Box::new(Expression::field(ANCESTORS)), empty()),
		]),
	)]));

	// Bucket the closure by level.
	let mut fields = vec![
		(ID.to_owned(), Expression::field(ID)),
		(INTERNAL_ID.to_owned(), Expression::field(INTERNAL_ID)),
	];
	fields.extend(Level::ALL.into_iter().map(|level| {
		let expression = Expression::Filter {
			input: Box::new(Expression::field(CLOSURE)),
			cond: Filter::eq(RESOURCE_TYPE, level),
		};
		(level.field().to_owned(), expression)
	}));
	pipeline.push(Stage::Project(fields));

	// Join the sort tags.
	if let Some(tags) = config.sort_tags.get(unit.level) {
		let filters = tags
			.iter()
			.map(|tag| Filter::eq("tagGroup", tag.group).and(Filter::eq("tagElement", tag.element)))
			.collect();
		pipeline.push(Stage::Lookup(Lookup {
			from: config.metadata_collection.clone(),
			local_field: INTERNAL_ID.to_owned(),
			foreign_field: "id".to_owned(),
			filter: Filter::Or(filters),
			output: SORTS.to_owned(),
		}));
	}

	pipeline
}

/// Split the sorted identities of a level's pending resources into pages of at most `page_size`.
#[must_use]
pub fn keyset(level: Level, ids: &[i64], page_size: u64) -> Vec<Unit> {
	let page_size = usize::try_from(page_size).unwrap_or(usize::MAX).max(1);
	ids.chunks(page_size)
		.zip(1..)
		.filter_map(|(chunk, page)| {
			let start = *chunk.first()?;
			let end = chunk.last()?.checked_add(1)?;
			let bounds = Bounds::Keys { start, end };
			Some(Unit { level, page, bounds })
		})
		.collect()
}

/// Split a level's pending resources into `ceil(count / page_size)` offset pages.
#[must_use]
pub fn offset(level: Level, count: u64, page_size: u64) -> Vec<Unit> {
	let page_size = page_size.max(1);
	(1..=count.div_ceil(page_size))
		.map(|page| {
			let bounds = Bounds::Offset {
				skip: (page - 1) * page_size,
				limit: page_size,
			};
			Unit { level, page, bounds }
		})
		.collect()
}
