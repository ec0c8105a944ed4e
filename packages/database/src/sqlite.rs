use {
	crate::{
		BulkWriteOutput, Document, Error as _, Filter, FindOptions, ID, Source, Stage, UpdateOne,
		Value, WriteError, pipeline,
	},
	indoc::{formatdoc, indoc},
	num::ToPrimitive as _,
	rusqlite as sqlite,
	std::{path::PathBuf, sync::Arc},
};


#[derive(Debug, derive_more::Display, derive_more::Error, derive_more::From)]
pub enum Error {
	Sqlite(sqlite::Error),
	Json(serde_json::Error),
	Other(Box<dyn std::error::Error + Send + Sync>),
}

type Initialize = Arc<dyn Fn(&sqlite::Connection) -> sqlite::Result<()> + Send + Sync + 'static>;

#[derive(Clone)]
pub struct DatabaseOptions {
	pub flags: sqlite::OpenFlags,
	pub initialize: Initialize,
	pub path: PathBuf,
}

pub struct Database {
	options: DatabaseOptions,
}

/// A connection. Each connection owns a SQLite connection on a dedicated blocking thread.
pub struct Connection {
	sender: tokio::sync::mpsc::UnboundedSender<Message>,
}

type Message = Box<dyn FnOnce(&mut sqlite::Connection) + Send>;

struct Documents<'a> {
	connection: &'a sqlite::Connection,
}

impl DatabaseOptions {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		let initialize = Arc::new(|connection: &sqlite::Connection| {
			connection.pragma_update(None, "busy_timeout", "5000")?;
			connection.pragma_update(None, "journal_mode", "wal")?;
			connection.pragma_update(None, "synchronous", "normal")?;
			Ok(())
		});
		Self {
			flags: sqlite::OpenFlags::default(),
			initialize,
			path: path.into(),
		}
	}
}

impl Database {
	pub async fn new(options: DatabaseOptions) -> Result<Self, Error> {
		let connection = Connection::connect(&options).await?;
		connection
			.with(|connection| {
				let statement = indoc!(
					"
						create table if not exists documents (
							id integer primary key autoincrement,
							collection text not null,
							document text not null
						);

						create index if not exists documents_collection_index on documents (collection, id);
					"
				);
				connection.execute_batch(statement)?;
				Ok::<_, Error>(())
			})
			.await?;
		Ok(Self { options })
	}
}

impl Connection {
	pub async fn connect(options: &DatabaseOptions) -> Result<Self, Error> {
		let path = options.path.clone();
		let flags = options.flags;
		let initialize = options.initialize.clone();
		let connection = tokio::task::spawn_blocking(move || {
			let connection = sqlite::Connection::open_with_flags(path, flags)?;
			initialize(&connection)?;
			Ok::<_, Error>(connection)
		})
		.await
		.map_err(Error::other)??;
		let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
		tokio::task::spawn_blocking(|| Self::run(connection, receiver));
		Ok(Self { sender })
	}

	fn run(
		mut connection: sqlite::Connection,
		mut receiver: tokio::sync::mpsc::UnboundedReceiver<Message>,
	) {
		while let Some(f) = receiver.blocking_recv() {
			f(&mut connection);
		}
	}

	pub async fn with<F, T, E>(&self, f: F) -> Result<T, Error>
	where
		F: FnOnce(&mut sqlite::Connection) -> Result<T, E> + Send + 'static,
		T: Send + 'static,
		E: Into<Error> + Send + 'static,
	{
		let (sender, receiver) = tokio::sync::oneshot::channel();
		let message: Message = Box::new(move |connection| {
			sender.send(f(connection).map_err(Into::into)).ok();
		});
		self.sender
			.send(message)
			.map_err(|_| Error::other("the connection was closed"))?;
		receiver
			.await
			.map_err(|_| Error::other("the connection task failed"))?
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
		Connection::connect(&self.options).await
	}
}

impl crate::Connection for Connection {
	type Error = Error;

	async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, Self::Error> {
		let collection = collection.to_owned();
		let filter = filter.clone();
		self.with(move |connection| {
			let mut params = vec![sqlite::types::Value::Text(collection.clone())];
			if let Some(condition) = compile(&filter, &mut params) {
				let statement = formatdoc!(
					"
						select count(*)
						from documents
						where collection = ?1 and ({condition});
					"
				);
				let count = connection.query_row(
					&statement,
					sqlite::params_from_iter(params),
					|row| row.get::<_, i64>(0),
				)?;
				return Ok(count.to_u64().unwrap_or_default());
			}
			let documents = Documents { connection };
			let count = documents
				.find(&collection, &filter, FindOptions::default())?
				.len();
			Ok::<_, Error>(count.to_u64().unwrap_or_default())
		})
		.await
	}

	async fn aggregate(
		&self,
		collection: &str,
		pipeline: &[Stage],
	) -> Result<Vec<Document>, Self::Error> {
		let collection = collection.to_owned();
		let pipeline = pipeline.to_vec();
		self.with(move |connection| {
			let documents = Documents { connection };
			pipeline::evaluate(&documents, &collection, &pipeline)
		})
		.await
	}

	async fn bulk_write(
		&self,
		collection: &str,
		operations: Vec<UpdateOne>,
	) -> Result<BulkWriteOutput, Self::Error> {
		let collection = collection.to_owned();
		self.with(move |connection| {
			let transaction =
				connection.transaction_with_behavior(sqlite::TransactionBehavior::Immediate)?;
			let mut output = BulkWriteOutput::default();
			{
				let documents = Documents {
					connection: &transaction,
				};
				let statement = indoc!(
					"
						update documents
						set document = ?1
						where id = ?2;
					"
				);
				let mut statement = transaction.prepare_cached(statement)?;
				for (index, operation) in operations.iter().enumerate() {
					let options = FindOptions {
						skip: 0,
						limit: Some(1),
					};
					let Some(mut document) = documents
						.find(&collection, &operation.filter, options)?
						.into_iter()
						.next()
					else {
						continue;
					};
					output.matched += 1;
					match operation.apply(&mut document) {
						Ok(true) => {
							let id = document.remove(ID).and_then(|id| id.as_i64());
							let text = serde_json::to_string(&document)?;
							statement.execute(sqlite::params![text, id])?;
							output.modified += 1;
						},
						Ok(false) => (),
						Err(message) => output.write_errors.push(WriteError { index, message }),
					}
				}
			}
			transaction.commit()?;
			Ok::<_, Error>(output)
		})
		.await
	}

	async fn insert_many(
		&self,
		collection: &str,
		documents: Vec<Document>,
	) -> Result<Vec<i64>, Self::Error> {
		let collection = collection.to_owned();
		self.with(move |connection| {
			let transaction =
				connection.transaction_with_behavior(sqlite::TransactionBehavior::Immediate)?;
			let mut ids = Vec::with_capacity(documents.len());
			{
				let statement = indoc!(
					"
						insert into documents (collection, document)
						values (?1, ?2);
					"
				);
				let mut statement = transaction.prepare_cached(statement)?;
				for mut document in documents {
					document.remove(ID);
					let text = serde_json::to_string(&document)?;
					statement.execute(sqlite::params![collection, text])?;
					ids.push(transaction.last_insert_rowid());
				}
			}
			transaction.commit()?;
			Ok::<_, Error>(ids)
		})
		.await
	}

	async fn create_index(&self, collection: &str, field: &str) -> Result<(), Self::Error> {
		if field == ID {
			return Ok(());
		}
		if !is_identifier(collection) || !is_identifier(field) {
			return Err(Error::other(format!(
				"cannot index the field {field:?} of the collection {collection:?}"
			)));
		}
		let statement = formatdoc!(
			r#"
				create index if not exists "documents_{collection}_{field}_index"
				on documents (collection, json_extract(document, '$."{field}"'));
			"#
		);
		self.with(move |connection| connection.execute_batch(&statement))
			.await
	}
}

impl Source for Documents<'_> {
	type Error = Error;

	fn find(
		&self,
		collection: &str,
		filter: &Filter,
		options: FindOptions,
	) -> Result<Vec<Document>, Self::Error> {
		let mut params = vec![sqlite::types::Value::Text(collection.to_owned())];
		let condition = compile(filter, &mut params);

		// Push the filter, skip, and limit into the statement when the filter compiles.
		let (condition, pushed) = match &condition {
			Some(condition) => {
				let limit = options.limit.and_then(|limit| limit.to_i64()).unwrap_or(-1);
				let skip = options.skip.to_i64().unwrap_or(i64::MAX);
				params.push(limit.into());
				params.push(skip.into());
				let n = params.len();
				let condition = format!("({condition}) order by id limit ?{} offset ?{n}", n - 1);
				(condition, true)
			},
			None => {
				tracing::trace!(?filter, "evaluating the filter in process");
				("1 order by id".to_owned(), false)
			},
		};
		let statement = formatdoc!(
			"
				select id, document
				from documents
				where collection = ?1 and {condition};
			"
		);
		let mut statement = self.connection.prepare_cached(&statement)?;
		let mut rows = statement.query(sqlite::params_from_iter(params))?;
		let mut documents = Vec::new();
		while let Some(row) = rows.next()? {
			let id = row.get::<_, i64>(0)?;
			let text = row.get::<_, String>(1)?;
			let mut document = serde_json::from_str::<Document>(&text)?;
			document.insert(ID.to_owned(), Value::from(id));
			documents.push(document);
		}

		if pushed {
			return Ok(documents);
		}
		let skip = options.skip.to_usize().unwrap_or(usize::MAX);
		let limit = options
			.limit
			.and_then(|limit| limit.to_usize())
			.unwrap_or(usize::MAX);
		let documents = documents
			.into_iter()
			.filter(|document| filter.matches(document))
			.skip(skip)
			.take(limit)
			.collect();
		Ok(documents)
	}
}

/// Compile a filter to a SQL condition, appending its parameters. Returns `None` if the filter cannot be expressed in SQL, in which case the caller filters in memory.
fn compile(filter: &Filter, params: &mut Vec<sqlite::types::Value>) -> Option<String> {
	match filter {
		Filter::All => Some("1".to_owned()),

		Filter::Eq(field, value) => {
			let expression = expression(field)?;
			if value.is_null() {
				return Some(format!("{expression} is null"));
			}
			let type_ = json_type(value)?;
			let type_expression = type_expression(field)?;
			let param = param(value, params)?;
			Some(format!("({type_expression} = '{type_}' and {expression} = {param})"))
		},

		Filter::In(field, values) => {
			let expression = expression(field)?;
			if values.is_empty() {
				return Some("0".to_owned());
			}
			if !values.iter().all(|value| value.is_number() || value.is_string()) {
				return None;
			}

			// Bind the values as one JSON array. SQLite limits the number of parameters.
			let values = serde_json::to_string(values).ok()?;
			params.push(sqlite::types::Value::Text(values));
			let n = params.len();
			let type_expression = type_expression(field)?;
			Some(format!(
				"({type_expression} in ('integer', 'real', 'text') and {expression} in (select value from json_each(?{n})))"
			))
		},

		Filter::Gte(field, value) | Filter::Lt(field, value) => {
			if !value.is_number() && !value.is_string() {
				return None;
			}
			let expression = expression(field)?;
			let param = param(value, params)?;
			let operator = if matches!(filter, Filter::Gte(..)) {
				">="
			} else {
				"<"
			};
			let type_ = if value.is_number() {
				"in ('integer', 'real')"
			} else {
				"= 'text'"
			};
			let type_expression = type_expression(field)?;
			Some(format!(
				"({type_expression} {type_} and {expression} {operator} {param})"
			))
		},

		Filter::Missing(field) => {
			if field == ID {
				return Some("0".to_owned());
			}
			let type_expression = type_expression(field)?;
			Some(format!(
				"({type_expression} is null or {type_expression} = 'null')"
			))
		},

		Filter::Present(field) => {
			if field == ID {
				return Some("1".to_owned());
			}
			let type_expression = type_expression(field)?;
			Some(format!("coalesce({type_expression} != 'null', 0)"))
		},

		Filter::And(filters) | Filter::Or(filters) => {
			if filters.is_empty() {
				let empty = if matches!(filter, Filter::And(_)) {
					"1"
				} else {
					"0"
				};
				return Some(empty.to_owned());
			}
			let separator = if matches!(filter, Filter::And(_)) {
				" and "
			} else {
				" or "
			};
			let conditions = filters
				.iter()
				.map(|filter| compile(filter, params).map(|condition| format!("({condition})")))
				.collect::<Option<Vec<_>>>()?;
			Some(conditions.join(separator))
		},
	}
}

fn expression(field: &str) -> Option<String> {
	if field == ID {
		return Some("id".to_owned());
	}
	if !is_identifier(field) {
		return None;
	}
	Some(format!("json_extract(document, '$.\"{field}\"')"))
}

fn type_expression(field: &str) -> Option<String> {
	if field == ID {
		return Some("'integer'".to_owned());
	}
	if !is_identifier(field) {
		return None;
	}
	Some(format!("json_type(document, '$.\"{field}\"')"))
}

/// The `json_type` of a value that can be bound as a parameter.
fn json_type(value: &Value) -> Option<&'static str> {
	match value {
		Value::Number(number) if number.is_i64() => Some("integer"),
		Value::Number(_) => Some("real"),
		Value::String(_) => Some("text"),
		Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
	}
}

fn param(value: &Value, params: &mut Vec<sqlite::types::Value>) -> Option<String> {
	let value = match value {
		Value::Number(number) => {
			if let Some(number) = number.as_i64() {
				sqlite::types::Value::Integer(number)
			} else {
				sqlite::types::Value::Real(number.as_f64()?)
			}
		},
		Value::String(value) => sqlite::types::Value::Text(value.clone()),
		Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => return None,
	};
	params.push(value);
	Some(format!("?{}", params.len()))
}

fn is_identifier(name: &str) -> bool {
	!name.is_empty()
		&& name
			.chars()
			.all(|char| char.is_ascii_alphanumeric() || char == '_')
}
