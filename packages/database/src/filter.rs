use {
	crate::{Document, Value},
	std::cmp::Ordering,
};

/// A predicate over the top level fields of a document.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
	All,
	Eq(String, Value),
	In(String, Vec<Value>),
	Gte(String, Value),
	Lt(String, Value),
	/// Matches documents where the field is absent or null.
	Missing(String),
	/// Matches documents where the field is present and not null.
	Present(String),
	And(Vec<Filter>),
	Or(Vec<Filter>),
}

impl Filter {
	pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
		Self::Eq(field.into(), value.into())
	}

	pub fn missing(field: impl Into<String>) -> Self {
		Self::Missing(field.into())
	}

	#[must_use]
	pub fn and(self, other: Self) -> Self {
		match (self, other) {
			(Self::All, other) | (other, Self::All) => other,
			(Self::And(mut filters), Self::And(others)) => {
				filters.extend(others);
				Self::And(filters)
			},
			(Self::And(mut filters), other) => {
				filters.push(other);
				Self::And(filters)
			},
			(filter, other) => Self::And(vec![filter, other]),
		}
	}

	#[must_use]
	pub fn matches(&self, document: &Document) -> bool {
		match self {
			Self::All => true,
			Self::Eq(field, value) => match document.get(field) {
				Some(field) => field == value,
				None => value.is_null(),
			},
			Self::In(field, values) => {
				let field = document.get(field).unwrap_or(&Value::Null);
				values.contains(field)
			},
			Self::Gte(field, value) => document
				.get(field)
				.and_then(|field| compare(field, value))
				.is_some_and(Ordering::is_ge),
			Self::Lt(field, value) => document
				.get(field)
				.and_then(|field| compare(field, value))
				.is_some_and(Ordering::is_lt),
			Self::Missing(field) => document.get(field).is_none_or(Value::is_null),
			Self::Present(field) => document.get(field).is_some_and(|value| !value.is_null()),
			Self::And(filters) => filters.iter().all(|filter| filter.matches(document)),
			Self::Or(filters) => filters.iter().any(|filter| filter.matches(document)),
		}
	}
}

/// Compare two values of the same kind. Values of different kinds are not ordered.
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
	match (a, b) {
		(Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
			(Some(a), Some(b)) => Some(a.cmp(&b)),
			_ => a.as_f64()?.partial_cmp(&b.as_f64()?),
		},
		(Value::String(a), Value::String(b)) => Some(a.cmp(b)),
		(Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
		_ => None,
	}
}
