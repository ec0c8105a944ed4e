use {std::sync::Arc, strata_database as db, strata_error as se};

pub use self::{
	closure::{Bounds, Unit},
	config::{Config, Pagination, SortTags, Tag},
	driver::{Output, Pending, Status},
	event::Event,
	level::Level,
	resource::{Derived, Resource},
	worker::{Record, Update},
};

pub mod closure;
pub mod config;
mod dispatch;
mod driver;
mod event;
mod level;
pub mod resource;
pub mod worker;

#[cfg(test)]
mod tests;

/// Materializes the closure of every resource in the tree onto the resource.
pub struct Index<D> {
	config: Arc<Config>,
	database: Arc<D>,
	events: Option<tokio::sync::mpsc::UnboundedSender<Event>>,
}

impl<D> Index<D>
where
	D: db::Database + Send + Sync + 'static,
{
	pub fn new(database: D, config: Config) -> se::Result<Self> {
		config
			.validate()
			.map_err(|source| se::error!(!source, "invalid config"))?;
		Ok(Self {
			config: Arc::new(config),
			database: Arc::new(database),
			events: None,
		})
	}

	/// Receive the progress events of subsequent runs.
	pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<Event> {
		let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
		self.events.replace(sender);
		receiver
	}

	#[must_use]
	pub fn config(&self) -> &Config {
		&self.config
	}

	#[must_use]
	pub fn database(&self) -> &D {
		&self.database
	}

	fn publish(&self, event: Event) {
		if let Some(events) = &self.events {
			events.send(event).ok();
		}
	}
}

impl<D> Clone for Index<D> {
	fn clone(&self) -> Self {
		Self {
			config: self.config.clone(),
			database: self.database.clone(),
			events: self.events.clone(),
		}
	}
}
