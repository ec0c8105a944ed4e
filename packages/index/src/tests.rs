use {
	crate::{Config, Derived, Event, Index, Level, Pagination, Resource, Status},
	pretty_assertions::assert_eq,
	serde_json::json,
	std::{
		collections::{BTreeMap, BTreeSet},
		sync::{Arc, Mutex},
		time::Duration,
	},
	strata_database::{self as db, Filter, prelude::*},
	strata_error as se,
};

fn resource(internal_id: i64, parent_id: Option<i64>, level: Level) -> db::Document {
	let mut document = db::Document::new();
	document.insert("internalId".to_owned(), internal_id.into());
	if let Some(parent_id) = parent_id {
		document.insert("parentId".to_owned(), parent_id.into());
	}
	document.insert("resourceType".to_owned(), level.into());
	if level == Level::Leaf {
		document.insert("publicId".to_owned(), format!("leaf-{internal_id}").into());
	}
	document
}

/// One collection with two groups, two subgroups per group, and two leaves per subgroup.
fn tree() -> Vec<db::Document> {
	let mut documents = vec![resource(1, None, Level::Collection)];
	for g in 0..2 {
		let group = 2 + g;
		documents.push(resource(group, Some(1), Level::Group));
		for s in 0..2 {
			let subgroup = 4 + g * 2 + s;
			documents.push(resource(subgroup, Some(group), Level::Subgroup));
			for l in 0..2 {
				let leaf = 8 + (g * 2 + s) * 2 + l;
				documents.push(resource(leaf, Some(subgroup), Level::Leaf));
			}
		}
	}
	documents
}

/// Several collections of uneven shape, including subgroups without leaves.
fn forest() -> Vec<db::Document> {
	let mut documents = Vec::new();
	let mut next = 100;
	let mut id = || {
		next += 1;
		next
	};
	for c in 0..3 {
		let collection = id();
		documents.push(resource(collection, None, Level::Collection));
		for _ in 0..=c {
			let group = id();
			documents.push(resource(group, Some(collection), Level::Group));
			for s in 0..2 {
				let subgroup = id();
				documents.push(resource(subgroup, Some(group), Level::Subgroup));
				for _ in 0..(c + s) % 3 {
					let leaf = id();
					documents.push(resource(leaf, Some(subgroup), Level::Leaf));
				}
			}
		}
	}
	documents
}

async fn insert<D>(database: &D, collection: &str, documents: Vec<db::Document>) -> se::Result<()>
where
	D: db::Database,
{
	let connection = database
		.connection()
		.await
		.map_err(|source| se::error!(!source, "failed to get a database connection"))?;
	connection
		.insert_many(collection, documents)
		.await
		.map_err(|source| se::error!(!source, "failed to insert the documents"))?;
	Ok(())
}

async fn resources<D>(index: &Index<D>) -> se::Result<BTreeMap<i64, Resource>>
where
	D: db::Database + Send + Sync + 'static,
{
	let connection = index
		.database()
		.connection()
		.await
		.map_err(|source| se::error!(!source, "failed to get a database connection"))?;
	let resources = connection
		.aggregate_into::<Resource>(&index.config().collection, &[])
		.await
		.map_err(|source| se::error!(!source, "failed to read the resources"))?;
	let resources = resources
		.into_iter()
		.map(|resource| (resource.internal_id, resource))
		.collect();
	Ok(resources)
}

fn members(resource: &Resource, level: Level) -> Vec<i64> {
	resource
		.derived(level)
		.members()
		.map(<[i64]>::to_vec)
		.unwrap_or_default()
}

fn set(members: &[i64]) -> BTreeSet<i64> {
	members.iter().copied().collect()
}

/// Compute the closure of a resource by walking the tree directly.
fn brute_force_closure(resources: &BTreeMap<i64, Resource>, id: i64) -> BTreeSet<i64> {
	let mut closure = BTreeSet::from([id]);
	let mut parent = resources.get(&id).and_then(|resource| resource.parent_id);
	while let Some(id) = parent {
		let Some(resource) = resources.get(&id) else {
			break;
		};
		if !closure.insert(id) {
			break;
		}
		parent = resource.parent_id;
	}
	let mut stack = vec![id];
	while let Some(id) = stack.pop() {
		for resource in resources.values() {
			if resource.parent_id == Some(id) && closure.insert(resource.internal_id) {
				stack.push(resource.internal_id);
			}
		}
	}
	closure
}

/// A memory store which delays closure queries and bulk writes, and records the closure queries in flight.
#[derive(Clone, Default)]
struct Delayed {
	database: db::memory::Database,
	query_delay: Duration,
	write_delay: Duration,
	flight: Arc<Mutex<Flight>>,
}

struct DelayedConnection {
	connection: db::memory::Connection,
	query_delay: Duration,
	write_delay: Duration,
	flight: Arc<Mutex<Flight>>,
}

#[derive(Default)]
struct Flight {
	running: usize,
	peak: usize,
	finished: usize,

	/// The number of finished closure queries when each closure query started.
	starts: Vec<usize>,
}

impl db::Database for Delayed {
	type Error = db::memory::Error;

	type Connection = DelayedConnection;

	async fn connection(&self) -> Result<Self::Connection, Self::Error> {
		let connection = self.database.connection().await?;
		Ok(DelayedConnection {
			connection,
			query_delay: self.query_delay,
			write_delay: self.write_delay,
			flight: self.flight.clone(),
		})
	}
}

impl db::Connection for DelayedConnection {
	type Error = db::memory::Error;

	async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, Self::Error> {
		self.connection.count(collection, filter).await
	}

	async fn aggregate(
		&self,
		collection: &str,
		pipeline: &[db::Stage],
	) -> Result<Vec<db::Document>, Self::Error> {
		let closure = pipeline
			.iter()
			.any(|stage| matches!(stage, db::Stage::GraphLookup(_)));
		if !closure {
			return self.connection.aggregate(collection, pipeline).await;
		}
		{
			let mut flight = self.flight.lock().unwrap();
			flight.running += 1;
			flight.peak = flight.peak.max(flight.running);
			let finished = flight.finished;
			flight.starts.push(finished);
		}
		tokio::time::sleep(self.query_delay).await;
		let result = self.connection.aggregate(collection, pipeline).await;
		{
			let mut flight = self.flight.lock().unwrap();
			flight.running -= 1;
			flight.finished += 1;
		}
		result
	}

	async fn bulk_write(
		&self,
		collection: &str,
		operations: Vec<db::UpdateOne>,
	) -> Result<db::BulkWriteOutput, Self::Error> {
		tokio::time::sleep(self.write_delay).await;
		self.connection.bulk_write(collection, operations).await
	}

	async fn insert_many(
		&self,
		collection: &str,
		documents: Vec<db::Document>,
	) -> Result<Vec<i64>, Self::Error> {
		self.connection.insert_many(collection, documents).await
	}

	async fn create_index(&self, collection: &str, field: &str) -> Result<(), Self::Error> {
		self.connection.create_index(collection, field).await
	}
}

fn config() -> Config {
	Config {
		page_size: 3,
		..Config::default()
	}
}

#[tokio::test]
async fn denormalize_tree() -> se::Result<()> {
	let database = db::memory::Database::new();
	insert(&database, "Resources", tree()).await?;
	let index = Index::new(database, Config::default())?;

	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Converged);
	assert_eq!(output.cycles, 1);
	assert_eq!(output.failures, 0);

	let resources = resources(&index).await?;
	assert_eq!(resources.len(), 15);
	let collection = &resources[&1];
	assert_eq!(
		set(&members(collection, Level::Leaf)),
		(8..16).collect::<BTreeSet<_>>()
	);
	assert_eq!(members(collection, Level::Collection), vec![1]);
	for leaf in 8..16 {
		assert_eq!(members(&resources[&leaf], Level::Collection), vec![1]);
	}
	for (subgroup, group) in [(4, 2), (5, 2), (6, 3), (7, 3)] {
		assert_eq!(members(&resources[&subgroup], Level::Group), vec![group]);
	}
	assert_eq!(resources[&8].instance_public_id.as_deref(), Some("leaf-8"));
	assert_eq!(resources[&4].instance_public_id.as_deref(), Some("leaf-8"));
	assert!(resources.values().all(|resource| !resource.is_pending()));
	Ok(())
}

#[tokio::test]
async fn closures_match_a_brute_force_walk() -> se::Result<()> {
	let database = db::memory::Database::new();
	insert(&database, "Resources", forest()).await?;
	let index = Index::new(database, config())?;

	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Converged);

	let resources = resources(&index).await?;
	for resource in resources.values() {
		let closure = brute_force_closure(&resources, resource.internal_id);
		for level in Level::ALL {
			let expected = closure
				.iter()
				.copied()
				.filter(|id| resources[id].level == level)
				.collect::<BTreeSet<_>>();
			let actual = members(resource, level);
			assert_eq!(set(&actual), expected, "{} at {level}", resource.internal_id);
			assert_eq!(actual.len(), expected.len());
		}
	}
	Ok(())
}

#[tokio::test]
async fn denormalize_is_idempotent() -> se::Result<()> {
	let database = db::memory::Database::new();
	insert(&database, "Resources", forest()).await?;
	let index = Index::new(database, config())?;
	index.denormalize().await?;
	let first = resources(&index).await?;

	// Clear one derived field everywhere so that every resource is computed again.
	let connection = index
		.database()
		.connection()
		.await
		.map_err(|source| se::error!(!source, "failed to get a database connection"))?;
	let operations = first
		.values()
		.map(|resource| db::UpdateOne {
			filter: Filter::eq(db::ID, resource.id),
			set: [("2".to_owned(), json!(null))].into_iter().collect(),
		})
		.collect();
	connection
		.bulk_write("Resources", operations)
		.await
		.map_err(|source| se::error!(!source, "failed to clear the field"))?;
	assert_eq!(index.pending().await?.total(), first.len() as u64);

	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Converged);
	let second = resources(&index).await?;
	assert_eq!(first, second);
	Ok(())
}

#[tokio::test]
async fn pages_cover_every_pending_resource() -> se::Result<()> {
	let database = db::memory::Database::new();
	insert(&database, "Resources", forest()).await?;
	let config = Config {
		batch_size: 2,
		concurrency: 2,
		..config()
	};
	let mut index = Index::new(database, config)?;
	let mut events = index.subscribe();
	let pending = index.pending().await?;
	assert!(pending.get(Level::Leaf) > 3);

	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Converged);
	assert_eq!(output.cycles, 1);
	let pages = Level::ALL
		.into_iter()
		.map(|level| pending.get(level).div_ceil(3))
		.sum::<u64>();
	assert_eq!(output.units, pages);

	// Every resource is written exactly once.
	let mut requests = 0;
	let mut matched = 0;
	while let Ok(event) = events.try_recv() {
		match event {
			Event::Write { requests: n, .. } => requests += n,
			Event::Written { output, .. } => matched += output.matched,
			_ => (),
		}
	}
	assert_eq!(requests, pending.total());
	assert_eq!(matched, pending.total());
	Ok(())
}

#[tokio::test]
async fn offset_pagination_converges() -> se::Result<()> {
	let database = db::memory::Database::new();
	insert(&database, "Resources", forest()).await?;
	let config = Config {
		pagination: Pagination::Offset,
		batch_size: 1,
		concurrency: 1,
		..config()
	};
	let index = Index::new(database, config)?;
	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Converged);
	assert!(output.cycles >= 1);
	assert_eq!(index.pending().await?.total(), 0);
	Ok(())
}

#[tokio::test]
async fn units_in_a_group_write_disjoint_resources() -> se::Result<()> {
	let database = db::memory::Database::new();
	let mut documents = Vec::new();
	for collection in 0..50 {
		documents.push(resource(collection, None, Level::Collection));
	}
	for group in 0..30 {
		documents.push(resource(1000 + group, Some(group % 50), Level::Group));
	}
	insert(&database, "Resources", documents).await?;
	let config = Config {
		page_size: 100,
		..Config::default()
	};
	let mut index = Index::new(database, config)?;
	let mut events = index.subscribe();
	index.denormalize().await?;

	let mut written = Vec::new();
	while let Ok(event) = events.try_recv() {
		if let Event::Written {
			level,
			page,
			output,
		} = event
		{
			written.push((level, page, output.matched, output.modified));
		}
	}
	written.sort_unstable();
	assert_eq!(
		written,
		vec![(Level::Collection, 1, 50, 50), (Level::Group, 1, 30, 30)]
	);
	Ok(())
}

#[tokio::test]
async fn dangling_parents_and_self_cycles_terminate() -> se::Result<()> {
	let database = db::memory::Database::new();
	let mut documents = tree();
	documents.push(resource(50, Some(999), Level::Subgroup));
	documents.push(resource(51, Some(50), Level::Leaf));
	documents.push(resource(60, Some(60), Level::Group));
	insert(&database, "Resources", documents).await?;
	let index = Index::new(database, Config::default())?;

	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Converged);

	let resources = resources(&index).await?;
	let orphan = &resources[&50];
	assert_eq!(orphan.collections, Derived::Computed(vec![]));
	assert_eq!(orphan.groups, Derived::Computed(vec![]));
	assert_eq!(members(orphan, Level::Leaf), vec![51]);
	assert_eq!(members(&resources[&51], Level::Subgroup), vec![50]);

	// A resource that is its own parent is found by both traversals.
	assert_eq!(members(&resources[&60], Level::Group), vec![60, 60, 60]);
	Ok(())
}

#[tokio::test]
async fn unwritable_resources_stall() -> se::Result<()> {
	let database = db::memory::Database::new();
	insert(&database, "Resources", tree()).await?;
	database
		.protect("Resources", Filter::eq("internalId", 9))
		.map_err(|source| se::error!(!source, "failed to protect the resource"))?;
	let mut index = Index::new(database, Config::default())?;
	let mut events = index.subscribe();

	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Stalled { pending: 1 });
	assert_eq!(output.cycles, 2);
	assert_eq!(output.failures, 2);

	let mut errors = 0;
	let mut finished = false;
	while let Ok(event) = events.try_recv() {
		match event {
			Event::Written { output, .. } => errors += output.write_errors.len(),
			Event::Finished { .. } => finished = true,
			_ => (),
		}
	}
	assert_eq!(errors, 2);
	assert!(finished);
	Ok(())
}

#[tokio::test]
async fn max_cycles_exhausts() -> se::Result<()> {
	let database = db::memory::Database::new();
	insert(&database, "Resources", tree()).await?;
	database
		.protect("Resources", Filter::eq("internalId", 1))
		.map_err(|source| se::error!(!source, "failed to protect the resource"))?;
	let config = Config {
		max_cycles: Some(1),
		..Config::default()
	};
	let index = Index::new(database, config)?;
	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Exhausted { pending: 1 });
	assert_eq!(output.cycles, 1);
	Ok(())
}

#[tokio::test]
async fn sort_keys_are_joined_for_groups_and_subgroups() -> se::Result<()> {
	let database = db::memory::Database::new();
	insert(&database, "Resources", tree()).await?;
	let tags = [
		json!({ "id": 2, "tagGroup": 8, "tagElement": 48, "value": "120000" }),
		json!({ "id": 2, "tagGroup": 8, "tagElement": 32, "value": "20240101" }),
		json!({ "id": 2, "tagGroup": 8, "tagElement": 80, "value": "ignored" }),
		json!({ "id": 4, "tagGroup": 8, "tagElement": 33, "value": "20240102" }),
		json!({ "id": 8, "tagGroup": 8, "tagElement": 32, "value": "leaf" }),
	];
	let tags = tags
		.into_iter()
		.filter_map(|tag| tag.as_object().cloned())
		.collect();
	insert(&database, "MainDicomTags", tags).await?;
	let index = Index::new(database.clone(), Config::default())?;
	index.denormalize().await?;

	let resources = resources(&index).await?;
	assert_eq!(
		resources[&2].sort_key,
		Some(vec![json!("20240101"), json!("120000")])
	);
	assert_eq!(resources[&3].sort_key, Some(vec![]));
	assert_eq!(resources[&4].sort_key, Some(vec![json!("20240102")]));
	assert_eq!(resources[&1].sort_key, None);
	assert_eq!(resources[&8].sort_key, None);

	let indexes = database
		.indexes("Resources")
		.map_err(|source| se::error!(!source, "failed to get the indexes"))?;
	assert_eq!(
		indexes,
		["internalId", "parentId", "resourceType"]
			.into_iter()
			.map(ToOwned::to_owned)
			.collect::<BTreeSet<_>>()
	);
	Ok(())
}

#[test]
fn invalid_config() {
	let database = db::memory::Database::new();
	let config = Config {
		page_size: 0,
		..Config::default()
	};
	assert!(Index::new(database, config).is_err());
}

#[tokio::test]
async fn sqlite() -> se::Result<()> {
	let temp = tempfile::tempdir()
		.map_err(|source| se::error!(!source, "failed to create a temporary directory"))?;
	let options = db::sqlite::DatabaseOptions::new(temp.path().join("database"));
	let database = db::sqlite::Database::new(options)
		.await
		.map_err(|source| se::error!(!source, "failed to open the database"))?;
	insert(&database, "Resources", tree()).await?;
	let config = Config {
		page_size: 2,
		..Config::default()
	};
	let index = Index::new(database, config)?;

	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Converged);
	assert_eq!(output.cycles, 1);

	let resources = resources(&index).await?;
	assert_eq!(
		set(&members(&resources[&1], Level::Leaf)),
		(8..16).collect::<BTreeSet<_>>()
	);
	assert_eq!(members(&resources[&15], Level::Collection), vec![1]);
	assert_eq!(members(&resources[&15], Level::Group), vec![3]);
	assert_eq!(members(&resources[&7], Level::Group), vec![3]);
	Ok(())
}

#[tokio::test]
async fn sqlite_closures_wider_than_the_parameter_limit() -> se::Result<()> {
	let temp = tempfile::tempdir()
		.map_err(|source| se::error!(!source, "failed to create a temporary directory"))?;
	let options = db::sqlite::DatabaseOptions::new(temp.path().join("database"));
	let database = db::sqlite::Database::new(options)
		.await
		.map_err(|source| se::error!(!source, "failed to open the database"))?;
	let mut documents = vec![
		resource(1, None, Level::Collection),
		resource(2, Some(1), Level::Group),
		resource(3, Some(2), Level::Subgroup),
	];
	documents.extend((0..33_000).map(|leaf| resource(10 + leaf, Some(3), Level::Leaf)));
	insert(&database, "Resources", documents).await?;
	let index = Index::new(database, Config::default())?;

	let output = index.denormalize().await?;
	assert_eq!(output.status, Status::Converged);
	assert_eq!(output.failures, 0);

	let resources = resources(&index).await?;
	for id in [1, 2, 3] {
		assert_eq!(members(&resources[&id], Level::Leaf).len(), 33_000);
	}
	assert_eq!(members(&resources[&33_009], Level::Subgroup), vec![3]);
	Ok(())
}

#[tokio::test]
async fn timed_out_units_fail_and_stay_pending() -> se::Result<()> {
	let slow = Duration::from_millis(200);
	let fast = Duration::from_millis(10);
	let cases = [
		(
			Delayed {
				query_delay: slow,
				..Delayed::default()
			},
			Config {
				query_timeout: fast,
				..Config::default()
			},
		),
		(
			Delayed {
				write_delay: slow,
				..Delayed::default()
			},
			Config {
				write_timeout: fast,
				..Config::default()
			},
		),
		(
			Delayed {
				query_delay: slow,
				..Delayed::default()
			},
			Config {
				unit_timeout: fast,
				..Config::default()
			},
		),
	];
	for (database, config) in cases {
		insert(&database, "Resources", tree()).await?;
		let mut index = Index::new(database, config)?;
		let mut events = index.subscribe();

		let output = index.denormalize().await?;
		assert_eq!(output.status, Status::Stalled { pending: 15 });
		assert_eq!(output.failures, output.units);
		assert_eq!(index.pending().await?.total(), 15);

		let mut failed = 0;
		while let Ok(event) = events.try_recv() {
			if let Event::Failed { .. } = event {
				failed += 1;
			}
		}
		assert_eq!(failed, output.units);
	}
	Ok(())
}

#[tokio::test]
async fn groups_run_one_at_a_time_within_the_concurrency() -> se::Result<()> {
	for (batch_size, concurrency) in [(3, 8), (4, 2)] {
		let database = Delayed {
			query_delay: Duration::from_millis(20),
			..Delayed::default()
		};
		let documents = (0..12)
			.map(|collection| resource(collection, None, Level::Collection))
			.collect();
		insert(&database, "Resources", documents).await?;
		let config = Config {
			page_size: 1,
			batch_size,
			concurrency,
			..Config::default()
		};
		let index = Index::new(database.clone(), config)?;

		let output = index.denormalize().await?;
		assert_eq!(output.status, Status::Converged);
		assert_eq!(output.units, 12);

		let flight = database.flight.lock().unwrap();
		assert_eq!(flight.starts.len(), 12);
		assert!(flight.peak <= batch_size.min(concurrency));

		// A unit starts only after every unit of the previous groups has finished.
		for (unit, finished) in flight.starts.iter().enumerate() {
			assert!(*finished >= unit / batch_size * batch_size, "unit {unit}");
		}
	}
	Ok(())
}
