use {
	crate::{Document, Filter, ID, Value},
	std::collections::HashSet,
};

#[cfg(test)]
mod tests;

/// A stage of an aggregation pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Stage {
	Match(Filter),
	Skip(u64),
	Limit(u64),
	/// Set each field to the value of its expression, keeping the document's other fields.
	AddFields(Vec<(String, Expression)>),
	/// Replace each document with only the listed fields.
	Project(Vec<(String, Expression)>),
	GraphLookup(GraphLookup),
	Lookup(Lookup),
}

/// A recursive traversal of a collection.
///
/// The traversal starts with the values of `start_with`, finds every document in `from` whose `connect_to_field` equals one of the current values, and continues with the found documents' `connect_from_field` values until no new values are found. Each document is output at most once.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphLookup {
	pub from: String,
	pub start_with: Expression,
	pub connect_from_field: String,
	pub connect_to_field: String,
	pub output: String,
}

/// A join of the documents in `from` whose `foreign_field` equals the document's `local_field` and which match `filter`.
#[derive(Clone, Debug, PartialEq)]
pub struct Lookup {
	pub from: String,
	pub local_field: String,
	pub foreign_field: String,
	pub filter: Filter,
	pub output: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
	/// The whole current document.
	Root,
	Field(String),
	Literal(Value),
	Array(Vec<Expression>),
	/// The first expression, or the second if the first is null or missing.
	IfNull(Box<Expression>, Box<Expression>),
	/// The concatenation of arrays. Null if any input is not an array.
	ConcatArrays(Vec<Expression>),
	/// The elements of an array which match a filter.
	Filter {
		input: Box<Expression>,
		cond: Filter,
	},
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FindOptions {
	pub skip: u64,
	pub limit: Option<u64>,
}

/// A source of documents for the pipeline evaluator.
pub trait Source {
	type Error;

	/// Find the documents in a collection which match a filter, in the collection's natural order.
	fn find(
		&self,
		collection: &str,
		filter: &Filter,
		options: FindOptions,
	) -> Result<Vec<Document>, Self::Error>;
}

impl Expression {
	pub fn field(name: impl Into<String>) -> Self {
		Self::Field(name.into())
	}

	#[must_use]
	pub fn evaluate(&self, document: &Document) -> Value {
		match self {
			Self::Root => Value::Object(document.clone()),
			Self::Field(name) => document.get(name).cloned().unwrap_or(Value::Null),
			Self::Literal(value) => value.clone(),
			Self::Array(expressions) => Value::Array(
				expressions
					.iter()
					.map(|expression| expression.evaluate(document))
					.collect(),
			),
			Self::IfNull(expression, replacement) => match expression.evaluate(document) {
				Value::Null => replacement.evaluate(document),
				value => value,
			},
			Self::ConcatArrays(expressions) => {
				let mut output = Vec::new();
				for expression in expressions {
					let Value::Array(values) = expression.evaluate(document) else {
						return Value::Null;
					};
					output.extend(values);
				}
				Value::Array(output)
			},
			Self::Filter { input, cond } => {
				let Value::Array(values) = input.evaluate(document) else {
					return Value::Null;
				};
				let values = values
					.into_iter()
					.filter(|value| match value {
						Value::Object(item) => cond.matches(item),
						_ => false,
					})
					.collect();
				Value::Array(values)
			},
		}
	}
}

/// Run a pipeline against a collection of a source.
///
/// Leading match, skip, and limit stages are pushed down to the source so that it can page through the collection without loading it.
pub fn evaluate<S>(
	source: &S,
	collection: &str,
	pipeline: &[Stage],
) -> Result<Vec<Document>, S::Error>
where
	S: Source + ?Sized,
{
	let mut filter = Filter::All;
	let mut options = FindOptions::default();
	let mut pushed = 0;
	for stage in pipeline {
		match stage {
			Stage::Match(match_) if options.skip == 0 && options.limit.is_none() => {
				filter = filter.and(match_.clone());
			},
			Stage::Skip(n) => {
				options.skip += n;
				if let Some(limit) = &mut options.limit {
					*limit = limit.saturating_sub(*n);
				}
			},
			Stage::Limit(n) => {
				options.limit = Some(options.limit.map_or(*n, |limit| limit.min(*n)));
			},
			_ => break,
		}
		pushed += 1;
	}

	let mut documents = source.find(collection, &filter, options)?;
	for stage in &pipeline[pushed..] {
		documents = apply(source, stage, documents)?;
	}

	Ok(documents)
}

fn apply<S>(source: &S, stage: &Stage, documents: Vec<Document>) -> Result<Vec<Document>, S::Error>
where
	S: Source + ?Sized,
{
	let documents: Vec<Document> = match stage {
		Stage::Match(filter) => documents
			.into_iter()
			.filter(|document| filter.matches(document))
			.collect(),

		Stage::Skip(n) => documents
			.into_iter()
			.skip(usize::try_from(*n).unwrap_or(usize::MAX))
			.collect(),

		Stage::Limit(n) => documents
			.into_iter()
			.take(usize::try_from(*n).unwrap_or(usize::MAX))
			.collect(),

		Stage::AddFields(fields) => documents
			.into_iter()
			.map(|mut document| {
				let values = fields
					.iter()
					.map(|(name, expression)| (name.clone(), expression.evaluate(&document)))
					.collect::<Vec<_>>();
				document.extend(values);
				document
			})
			.collect(),

		Stage::Project(fields) => documents
			.iter()
			.map(|document| {
				fields
					.iter()
					.map(|(name, expression)| (name.clone(), expression.evaluate(document)))
					.collect()
			})
			.collect(),

		Stage::GraphLookup(lookup) => {
			let mut output = Vec::with_capacity(documents.len());
			for mut document in documents {
				let found = graph_lookup(source, lookup, &document)?;
				document.insert(lookup.output.clone(), Value::Array(found));
				output.push(document);
			}
			output
		},

		Stage::Lookup(lookup) => {
			let mut output = Vec::with_capacity(documents.len());
			for mut document in documents {
				let value = document
					.get(&lookup.local_field)
					.cloned()
					.unwrap_or(Value::Null);
				let filter =
					Filter::Eq(lookup.foreign_field.clone(), value).and(lookup.filter.clone());
				let found = source
					.find(&lookup.from, &filter, FindOptions::default())?
					.into_iter()
					.map(Value::Object)
					.collect();
				document.insert(lookup.output.clone(), Value::Array(found));
				output.push(document);
			}
			output
		},
	};
	Ok(documents)
}

fn graph_lookup<S>(
	source: &S,
	lookup: &GraphLookup,
	document: &Document,
) -> Result<Vec<Value>, S::Error>
where
	S: Source + ?Sized,
{
	// Values and identities are keyed by their JSON text.
	let mut visited = HashSet::new();
	let mut frontier = Vec::new();
	for value in values(lookup.start_with.evaluate(document)) {
		if visited.insert(value.to_string()) {
			frontier.push(value);
		}
	}

	let mut seen = HashSet::new();
	let mut output = Vec::new();
	while !frontier.is_empty() {
		let filter = Filter::In(lookup.connect_to_field.clone(), std::mem::take(&mut frontier));
		let found = source.find(&lookup.from, &filter, FindOptions::default())?;
		for found in found {
			let id = found.get(ID).map(ToString::to_string).unwrap_or_default();
			if !seen.insert(id) {
				continue;
			}
			let next = found
				.get(&lookup.connect_from_field)
				.cloned()
				.unwrap_or(Value::Null);
			for value in values(next) {
				if visited.insert(value.to_string()) {
					frontier.push(value);
				}
			}
			output.push(Value::Object(found));
		}
	}

	Ok(output)
}

/// Flatten a start or connect value into the values to search for. Null values are never searched for.
fn values(value: Value) -> Vec<Value> {
	match value {
		Value::Null => Vec::new(),
		Value::Array(values) => values.into_iter().filter(|value| !value.is_null()).collect(),
		value => vec![value],
	}
}
