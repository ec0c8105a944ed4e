use {
	crate::{
		Document, Expression, Filter, GraphLookup, ID, Lookup, Stage, Value,
		memory::{Database, Error},
		prelude::*,
	},
	pretty_assertions::assert_eq,
	serde_json::json,
};

fn document(value: Value) -> Document {
	match value {
		Value::Object(map) => map,
		_ => unreachable!(),
	}
}

fn ids(documents: &[Value]) -> Vec<i64> {
	let mut ids = documents
		.iter()
		.filter_map(|document| document.get(ID)?.as_i64())
		.collect::<Vec<_>>();
	ids.sort_unstable();
	ids
}

async fn tree() -> Result<Database, Error> {
	let database = Database::new();
	let connection = database.connection().await?;
	let documents = [
		json!({ "name": "a", "parent": null }),
		json!({ "name": "b", "parent": "a" }),
		json!({ "name": "c", "parent": "a" }),
		json!({ "name": "d", "parent": "b" }),
		json!({ "name": "e", "parent": "z" }),
	];
	connection
		.insert_many("nodes", documents.into_iter().map(document).collect())
		.await?;
	Ok(database)
}

fn descendants() -> Stage {
	Stage::GraphLookup(GraphLookup {
		from: "nodes".into(),
		start_with: Expression::field("name"),
		connect_from_field: "name".into(),
		connect_to_field: "parent".into(),
		output: "descendants".into(),
	})
}

fn ancestors() -> Stage {
	Stage::GraphLookup(GraphLookup {
		from: "nodes".into(),
		start_with: Expression::field("parent"),
		connect_from_field: "parent".into(),
		connect_to_field: "name".into(),
		output: "ancestors".into(),
	})
}

#[tokio::test]
async fn graph_lookup_finds_descendants() -> Result<(), Error> {
	let database = tree().await?;
	let connection = database.connection().await?;
	let pipeline = [Stage::Match(Filter::eq("name", "a")), descendants()];
	let output = connection.aggregate("nodes", &pipeline).await?;
	assert_eq!(output.len(), 1);
	let Some(Value::Array(descendants)) = output[0].get("descendants") else {
		unreachable!()
	};
	assert_eq!(ids(descendants), vec![2, 3, 4]);
	Ok(())
}

#[tokio::test]
async fn graph_lookup_finds_ancestors() -> Result<(), Error> {
	let database = tree().await?;
	let connection = database.connection().await?;
	let pipeline = [Stage::Match(Filter::eq("name", "d")), ancestors()];
	let output = connection.aggregate("nodes", &pipeline).await?;
	let Some(Value::Array(ancestors)) = output[0].get("ancestors") else {
		unreachable!()
	};
	assert_eq!(ids(ancestors), vec![1, 2]);
	Ok(())
}

#[tokio::test]
async fn graph_lookup_with_missing_start_is_empty() -> Result<(), Error> {
	let database = tree().await?;
	let connection = database.connection().await?;

	// The root has a null parent and "e" has a parent that does not exist.
	let pipeline = [
		Stage::Match(Filter::In("name".into(), vec![json!("a"), json!("e")])),
		ancestors(),
	];
	let output = connection.aggregate("nodes", &pipeline).await?;
	assert_eq!(output.len(), 2);
	for document in output {
		assert_eq!(document.get("ancestors"), Some(&json!([])));
	}
	Ok(())
}

#[tokio::test]
async fn graph_lookup_terminates_on_cycles() -> Result<(), Error> {
	let database = Database::new();
	let connection = database.connection().await?;
	let documents = [
		json!({ "name": "x", "parent": "y" }),
		json!({ "name": "y", "parent": "x" }),
		json!({ "name": "s", "parent": "s" }),
	];
	connection
		.insert_many("nodes", documents.into_iter().map(document).collect())
		.await?;

	let output = connection.aggregate("nodes", &[descendants()]).await?;
	let counts = output
		.iter()
		.map(|document| document["descendants"].as_array().map_or(0, Vec::len))
		.collect::<Vec<_>>();
	assert_eq!(counts, vec![2, 2, 1]);
	Ok(())
}

#[tokio::test]
async fn lookup_joins_matching_documents() -> Result<(), Error> {
	let database = tree().await?;
	let connection = database.connection().await?;
	let tags = [
		json!({ "node": "a", "tag": "date", "value": "20240101" }),
		json!({ "node": "a", "tag": "time", "value": "120000" }),
		json!({ "node": "b", "tag": "date", "value": "20230101" }),
	];
	connection
		.insert_many("tags", tags.into_iter().map(document).collect())
		.await?;

	let pipeline = [
		Stage::Match(Filter::eq("name", "a")),
		Stage::Lookup(Lookup {
			from: "tags".into(),
			local_field: "name".into(),
			foreign_field: "node".into(),
			filter: Filter::eq("tag", "date"),
			output: "tags".into(),
		}),
		Stage::Project(vec![
			("name".into(), Expression::field("name")),
			("tags".into(), Expression::field("tags")),
		]),
	];
	let output = connection.aggregate("tags_by_node", &pipeline).await?;
	assert!(output.is_empty());

	let output = connection.aggregate("nodes", &pipeline).await?;
	let expected = json!([{
		"name": "a",
		"tags": [{ "_id": 1, "node": "a", "tag": "date", "value": "20240101" }],
	}]);
	assert_eq!(Value::Array(output.into_iter().map(Value::Object).collect()), expected);
	Ok(())
}

#[test]
fn expressions() {
	let document = document(json!({
		"a": [{ "k": 1 }, { "k": 2 }, 3],
		"b": [4],
		"n": null,
	}));

	let expression = Expression::Filter {
		input: Box::new(Expression::field("a")),
		cond: Filter::eq("k", 2),
	};
	assert_eq!(expression.evaluate(&document), json!([{ "k": 2 }]));

	let expression = Expression::ConcatArrays(vec![
		Expression::field("b"),
		Expression::Array(vec![Expression::Literal(json!(5))]),
	]);
	assert_eq!(expression.evaluate(&document), json!([4, 5]));

	let expression =
		Expression::ConcatArrays(vec![Expression::field("b"), Expression::field("missing")]);
	assert_eq!(expression.evaluate(&document), Value::Null);

	let expression = Expression::IfNull(
		Box::new(Expression::field("n")),
		Box::new(Expression::Literal(json!([]))),
	);
	assert_eq!(expression.evaluate(&document), json!([]));
}

#[tokio::test]
async fn skip_and_limit_page_in_natural_order() -> Result<(), Error> {
	let database = tree().await?;
	let connection = database.connection().await?;
	let pipeline = [
		Stage::Match(Filter::Present("parent".into())),
		Stage::Skip(1),
		Stage::Limit(2),
		Stage::Project(vec![("name".into(), Expression::field("name"))]),
	];
	let output = connection.aggregate("nodes", &pipeline).await?;
	let names = output
		.iter()
		.filter_map(|document| document["name"].as_str())
		.collect::<Vec<_>>();
	assert_eq!(names, vec!["c", "d"]);

	// A match after a skip applies to the skipped page rather than the collection.
	let pipeline = [
		Stage::Limit(2),
		Stage::Match(Filter::eq("name", "c")),
	];
	let output = connection.aggregate("nodes", &pipeline).await?;
	assert!(output.is_empty());
	Ok(())
}
