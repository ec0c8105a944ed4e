use {
	crate::{Event, Index, Unit, worker},
	strata_database as db,
	strata_error as se,
};

/// A pool of workers which runs units in groups.
///
/// The workers live for the whole run. Each group of at most `batch_size` units is sent to the pool, and the next group is not sent until every unit of the previous group has finished.
pub(crate) struct Dispatcher {
	batch_size: usize,
	sender: async_channel::Sender<Job>,
	tasks: Vec<tokio::task::JoinHandle<()>>,
}

struct Job {
	unit: Unit,
	sender: tokio::sync::oneshot::Sender<se::Result<worker::Output>>,
}

impl Dispatcher {
	pub(crate) fn start<D>(index: &Index<D>) -> Self
	where
		D: db::Database + Send + Sync + 'static,
	{
		let batch_size = index.config.batch_size.max(1);
		let (sender, receiver) = async_channel::bounded(batch_size);
		let tasks = (0..index.config.concurrency.max(1))
			.map(|worker| {
				let index = index.clone();
				let receiver = receiver.clone();
				tokio::spawn(async move {
					index.worker_task(worker, receiver).await;
				})
			})
			.collect();
		Self {
			batch_size,
			sender,
			tasks,
		}
	}

	/// Run units in groups, returning each unit's result in order.
	pub(crate) async fn dispatch(
		&self,
		units: Vec<Unit>,
	) -> se::Result<Vec<(Unit, se::Result<worker::Output>)>> {
		let mut results = Vec::with_capacity(units.len());
		for (group, units) in units.chunks(self.batch_size).enumerate() {
			tracing::debug!(group, units = units.len(), "dispatching a group");
			let mut receivers = Vec::with_capacity(units.len());
			for unit in units {
				let (sender, receiver) = tokio::sync::oneshot::channel();
				let job = Job {
					unit: unit.clone(),
					sender,
				};
				self.sender
					.send(job)
					.await
					.map_err(|_| se::error!("the workers have stopped"))?;
				receivers.push(receiver);
			}

			// Wait for every unit of the group.
			let outputs = futures::future::join_all(receivers).await;
			for (unit, output) in units.iter().zip(outputs) {
				let output = output
					.map_err(|source| se::error!(!source, "the worker dropped the unit"))
					.and_then(|output| output);
				results.push((unit.clone(), output));
			}
		}
		Ok(results)
	}

	/// Close the queue and wait for the workers to exit.
	pub(crate) async fn stop(self) {
		self.sender.close();
		for task in self.tasks {
			task.await
				.inspect_err(|error| tracing::error!(?error, "a worker task panicked"))
				.ok();
		}
	}
}

impl<D> Index<D>
where
	D: db::Database + Send + Sync + 'static,
{
	async fn worker_task(&self, worker: usize, receiver: async_channel::Receiver<Job>) {
		let mut connection = None;
		while let Ok(job) = receiver.recv().await {
			let Job { unit, sender } = job;

			// Connect on the first unit, and reconnect after a failed connection.
			if connection.is_none() {
				match self.database.connection().await {
					Ok(new) => {
						connection.replace(new);
					},
					Err(source) => {
						let error =
							se::error!(!source, %worker, "failed to get a database connection");
						self.fail(&unit, &error);
						sender.send(Err(error)).ok();
						continue;
					},
				}
			}
			let Some(connection) = &connection else {
				continue;
			};

			let future = self.run_unit(connection, &unit);
			let result = tokio::time::timeout(self.config.unit_timeout, future)
				.await
				.map_err(|source| se::error!(!source, %worker, "the unit timed out"))
				.and_then(|output| output);
			if let Err(error) = &result {
				self.fail(&unit, error);
			}
			sender.send(result).ok();
		}
	}

	fn fail(&self, unit: &Unit, error: &se::Error) {
		tracing::error!(
			level = %unit.level,
			page = unit.page,
			error = %error.trace(),
			"the unit failed"
		);
		self.publish(Event::Failed {
			level: unit.level,
			page: unit.page,
			error: error.clone(),
		});
	}
}
