use crate::{Document, Filter, ID};

/// Set fields on the first document matching a filter.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOne {
	pub filter: Filter,
	pub set: Document,
}

/// The result of a bulk write.
///
/// Bulk writes are unordered. A failed operation is reported in `write_errors` and does not prevent the remaining operations from being applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteOutput {
	pub matched: u64,
	pub modified: u64,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub write_errors: Vec<WriteError>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct WriteError {
	/// The index of the failed operation in the bulk write.
	pub index: usize,
	pub message: String,
}

impl UpdateOne {
	/// Apply the update to a document. Returns whether the document was modified.
	pub fn apply(&self, document: &mut Document) -> Result<bool, String> {
		if self.set.contains_key(ID) {
			return Err(format!("the {ID} field is immutable"));
		}
		let mut modified = false;
		for (name, value) in &self.set {
			if document.get(name) != Some(value) {
				document.insert(name.clone(), value.clone());
				modified = true;
			}
		}
		Ok(modified)
	}
}

impl BulkWriteOutput {
	#[must_use]
	pub fn is_partial_failure(&self) -> bool {
		!self.write_errors.is_empty()
	}
}
