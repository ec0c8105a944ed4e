use {
	futures::FutureExt as _,
	itertools::Itertools as _,
	serde::de::DeserializeOwned,
};

pub use self::{
	filter::Filter,
	pipeline::{Expression, FindOptions, GraphLookup, Lookup, Source, Stage},
	update::{BulkWriteOutput, UpdateOne, WriteError},
};

pub mod filter;
pub mod memory;
pub mod pipeline;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod update;

pub mod prelude {
	pub use super::{Connection as _, Database as _, Error as _};
}

/// A document. Stored documents carry their store assigned identity in the `_id` field.
pub type Document = serde_json::Map<String, serde_json::Value>;

pub use serde_json::Value;

/// The name of the field holding a document's store assigned identity.
pub const ID: &str = "_id";

pub trait Error: std::error::Error + Send + Sync + 'static {
	fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self;
}

pub trait Database {
	type Error: Error;

	type Connection: Connection<Error = Self::Error> + Send + Sync + 'static;

	fn connection(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;
}

pub trait Connection {
	type Error: Error;

	fn count(
		&self,
		collection: &str,
		filter: &Filter,
	) -> impl Future<Output = Result<u64, Self::Error>> + Send;

	fn aggregate(
		&self,
		collection: &str,
		pipeline: &[Stage],
	) -> impl Future<Output = Result<Vec<Document>, Self::Error>> + Send;

	fn aggregate_into<T>(
		&self,
		collection: &str,
		pipeline: &[Stage],
	) -> impl Future<Output = Result<Vec<T>, Self::Error>> + Send
	where
		T: DeserializeOwned,
	{
		self.aggregate(collection, pipeline).map(|result| {
			result.and_then(|documents| {
				documents
					.into_iter()
					.map(|document| {
						serde_json::from_value(Value::Object(document)).map_err(Self::Error::other)
					})
					.try_collect()
			})
		})
	}

	fn bulk_write(
		&self,
		collection: &str,
		operations: Vec<UpdateOne>,
	) -> impl Future<Output = Result<BulkWriteOutput, Self::Error>> + Send;

	fn insert_many(
		&self,
		collection: &str,
		documents: Vec<Document>,
	) -> impl Future<Output = Result<Vec<i64>, Self::Error>> + Send;

	fn create_index(
		&self,
		collection: &str,
		field: &str,
	) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
