use {
	crate::{
		Event, Index, Level, Pagination, Unit, closure,
		dispatch::Dispatcher,
		resource::{self, INTERNAL_ID, PARENT_ID, RESOURCE_TYPE},
	},
	itertools::Itertools as _,
	num::ToPrimitive as _,
	strata_database::{self as db, Expression, ID, Stage, prelude::*},
	strata_error as se,
};

/// The number of pending resources at each level.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct Pending {
	pub levels: [u64; 4],
}

/// The output of a denormalization run.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct Output {
	pub cycles: u64,
	pub status: Status,

	/// The number of units dispatched.
	pub units: u64,

	/// The number of units which failed or reported write errors.
	pub failures: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Status {
	/// No resource is pending.
	Converged,

	/// The pending count did not decrease over a cycle. The remaining resources cannot be resolved.
	Stalled { pending: u64 },

	/// The maximum number of cycles was reached.
	Exhausted { pending: u64 },
}

#[derive(serde::Deserialize)]
struct Key {
	#[serde(rename = "_id")]
	id: i64,
}

impl Pending {
	#[must_use]
	pub fn total(&self) -> u64 {
		self.levels.iter().sum()
	}

	#[must_use]
	pub fn get(&self, level: Level) -> u64 {
		self.levels[level.index()]
	}
}

impl<D> Index<D>
where
	D: db::Database + Send + Sync + 'static,
{
	/// Sweep the resources until none is pending or the pending count stops decreasing.
	pub async fn denormalize(&self) -> se::Result<Output> {
		let connection = self
			.database
			.connection()
			.await
			.map_err(|source| se::error!(!source, "failed to get a database connection"))?;

		if self.config.create_indexes {
			self.create_indexes(&connection).await?;
		}

		let dispatcher = Dispatcher::start(self);
		let result = self.converge(&connection, &dispatcher).await;
		dispatcher.stop().await;
		let output = result?;

		tracing::info!(
			cycles = output.cycles,
			units = output.units,
			failures = output.failures,
			status = ?output.status,
			"finished"
		);
		self.publish(Event::Finished {
			output: output.clone(),
		});

		Ok(output)
	}

	async fn converge(
		&self,
		connection: &D::Connection,
		dispatcher: &Dispatcher,
	) -> se::Result<Output> {
		let mut cycles = 0;
		let mut units = 0;
		let mut failures = 0;
		let mut previous = None;
		let status = loop {
			let pending = self.pending_with_connection(connection).await?;
			let total = pending.total();
			tracing::info!(cycle = cycles + 1, pending = total, "measured the pending resources");
			self.publish(Event::Cycle {
				cycle: cycles + 1,
				pending,
			});

			if total == 0 {
				break Status::Converged;
			}
			if previous.is_some_and(|previous| total >= previous) {
				tracing::warn!(pending = total, "the pending count did not decrease");
				break Status::Stalled { pending: total };
			}
			if self.config.max_cycles.is_some_and(|max| cycles >= max) {
				break Status::Exhausted { pending: total };
			}

			// Sweep.
			let plan = self.plan(connection, &pending).await?;
			let results = dispatcher.dispatch(plan).await?;
			units += results.len().to_u64().unwrap_or_default();
			failures += results
				.iter()
				.filter(|(_, result)| match result {
					Ok(output) => output.output.is_partial_failure(),
					Err(_) => true,
				})
				.count()
				.to_u64()
				.unwrap_or_default();

			cycles += 1;
			previous = Some(total);
		};

		Ok(Output {
			cycles,
			status,
			units,
			failures,
		})
	}

	/// Count the pending resources at each level.
	pub async fn pending(&self) -> se::Result<Pending> {
		let connection = self
			.database
			.connection()
			.await
			.map_err(|source| se::error!(!source, "failed to get a database connection"))?;
		self.pending_with_connection(&connection).await
	}

	async fn pending_with_connection(&self, connection: &D::Connection) -> se::Result<Pending> {
		let mut pending = Pending::default();
		for level in Level::ALL {
			let filter = resource::pending_at(level);
			pending.levels[level.index()] = connection
				.count(&self.config.collection, &filter)
				.await
				.map_err(|source| se::error!(!source, %level, "failed to count the pending resources"))?;
		}
		Ok(pending)
	}

	/// Split each level's pending resources into units.
	async fn plan(&self, connection: &D::Connection, pending: &Pending) -> se::Result<Vec<Unit>> {
		let mut units = Vec::new();
		for level in Level::ALL {
			let count = pending.get(level);
			if count == 0 {
				continue;
			}
			match self.config.pagination {
				Pagination::Keyset => {
					let pipeline = [
						Stage::Match(resource::pending_at(level)),
						Stage::Project(vec![(ID.to_owned(), Expression::field(ID))]),
					];
					let ids = connection
						.aggregate_into::<Key>(&self.config.collection, &pipeline)
						.await
						.map_err(|source| se::error!(!source, %level, "failed to list the pending resources"))?
						.into_iter()
						.map(|key| key.id)
						.sorted_unstable()
						.collect::<Vec<_>>();
					units.extend(closure::keyset(level, &ids, self.config.page_size));
				},
				Pagination::Offset => {
					units.extend(closure::offset(level, count, self.config.page_size));
				},
			}
		}
		tracing::debug!(units = units.len(), "planned the sweep");
		Ok(units)
	}

	async fn create_indexes(&self, connection: &D::Connection) -> se::Result<()> {
		let indexes = [
			(&self.config.collection, INTERNAL_ID),
			(&self.config.collection, PARENT_ID),
			(&self.config.collection, RESOURCE_TYPE),
			(&self.config.metadata_collection, "id"),
		];
		for (collection, field) in indexes {
			connection
				.create_index(collection, field)
				.await
				.map_err(|source| se::error!(!source, %collection, %field, "failed to create the index"))?;
		}
		Ok(())
	}
}
