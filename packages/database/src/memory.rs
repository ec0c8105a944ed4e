use {
	crate::{
		BulkWriteOutput, Document, Error as _, Filter, FindOptions, ID, Source, Stage, UpdateOne,
		Value, WriteError, pipeline,
	},
	num::ToPrimitive as _,
	std::{
		collections::{BTreeMap, BTreeSet},
		sync::{Arc, RwLock},
	},
};

#[derive(Debug, derive_more::Display, derive_more::Error, derive_more::From)]
pub enum Error {
	Other(Box<dyn std::error::Error + Send + Sync>),
}

/// An in process document store. Clones share the same collections.
#[derive(Clone, Default)]
pub struct Database {
	state: Arc<RwLock<State>>,
}

pub struct Connection {
	state: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
	collections: BTreeMap<String, Collection>,
}

#[derive(Default)]
struct Collection {
	documents: Vec<Document>,
	indexes: BTreeSet<String>,
	next_id: i64,
	protected: Vec<Filter>,
}

impl Database {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Make the documents matching a filter read only. Updates to them fail with a write error.
	pub fn protect(&self, collection: &str, filter: Filter) -> Result<(), Error> {
		let mut state = self
			.state
			.write()
			.map_err(|_| Error::other("the lock was poisoned"))?;
		state
			.collections
			.entry(collection.to_owned())
			.or_default()
			.protected
			.push(filter);
		Ok(())
	}

	/// The fields indexed on a collection.
	pub fn indexes(&self, collection: &str) -> Result<BTreeSet<String>, Error> {
		let state = self
			.state
			.read()
			.map_err(|_| Error::other("the lock was poisoned"))?;
		let indexes = state
			.collections
			.get(collection)
			.map(|collection| collection.indexes.clone())
			.unwrap_or_default();
		Ok(indexes)
	}
}

impl crate::Error for Error {
	fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
		Self::Other(error.into())
	}
}

impl crate::Database for Database {
	type Error = Error;

	type Connection = Connection;

	async fn connection(&self) -> Result<Self::Connection, Self::Error> {
		let state = self.state.clone();
		Ok(Connection { state })
	}
}

impl Source for State {
	type Error = Error;

	fn find(
		&self,
		collection: &str,
		filter: &Filter,
		options: FindOptions,
	) -> Result<Vec<Document>, Self::Error> {
		let Some(collection) = self.collections.get(collection) else {
			return Ok(Vec::new());
		};
		let skip = options.skip.to_usize().unwrap_or(usize::MAX);
		let limit = options
			.limit
			.and_then(|limit| limit.to_usize())
			.unwrap_or(usize::MAX);
		let documents = collection
			.documents
			.iter()
			.filter(|document| filter.matches(document))
			.skip(skip)
			.take(limit)
			.cloned()
			.collect();
		Ok(documents)
	}
}

impl crate::Connection for Connection {
	type Error = Error;

	async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, Self::Error> {
		let state = self
			.state
			.read()
			.map_err(|_| Error::other("the lock was poisoned"))?;
		let count = state
			.collections
			.get(collection)
			.map_or(0, |collection| {
				collection
					.documents
					.iter()
					.filter(|document| filter.matches(document))
					.count()
			});
		Ok(count.to_u64().unwrap_or_default())
	}

	async fn aggregate(
		&self,
		collection: &str,
		pipeline: &[Stage],
	) -> Result<Vec<Document>, Self::Error> {
		let state = self
			.state
			.read()
			.map_err(|_| Error::other("the lock was poisoned"))?;
		pipeline::evaluate(&*state, collection, pipeline)
	}

	async fn bulk_write(
		&self,
		collection: &str,
		operations: Vec<UpdateOne>,
	) -> Result<BulkWriteOutput, Self::Error> {
		let mut state = self
			.state
			.write()
			.map_err(|_| Error::other("the lock was poisoned"))?;
		let collection = state.collections.entry(collection.to_owned()).or_default();
		let mut output = BulkWriteOutput::default();
		for (index, operation) in operations.iter().enumerate() {
			let Some(document) = collection
				.documents
				.iter_mut()
				.find(|document| operation.filter.matches(document))
			else {
				continue;
			};
			output.matched += 1;
			if collection
				.protected
				.iter()
				.any(|filter| filter.matches(document))
			{
				let message = "the document is read only".to_owned();
				output.write_errors.push(WriteError { index, message });
				continue;
			}
			match operation.apply(document) {
				Ok(true) => output.modified += 1,
				Ok(false) => (),
				Err(message) => output.write_errors.push(WriteError { index, message }),
			}
		}
		Ok(output)
	}

	async fn insert_many(
		&self,
		collection: &str,
		documents: Vec<Document>,
	) -> Result<Vec<i64>, Self::Error> {
		let mut state = self
			.state
			.write()
			.map_err(|_| Error::other("the lock was poisoned"))?;
		let collection = state.collections.entry(collection.to_owned()).or_default();
		let mut ids = Vec::with_capacity(documents.len());
		for mut document in documents {
			collection.next_id += 1;
			let id = collection.next_id;
			document.insert(ID.to_owned(), Value::from(id));
			collection.documents.push(document);
			ids.push(id);
		}
		Ok(ids)
	}

	async fn create_index(&self, collection: &str, field: &str) -> Result<(), Self::Error> {
		let mut state = self
			.state
			.write()
			.map_err(|_| Error::other("the lock was poisoned"))?;
		state
			.collections
			.entry(collection.to_owned())
			.or_default()
			.indexes
			.insert(field.to_owned());
		Ok(())
	}
}
