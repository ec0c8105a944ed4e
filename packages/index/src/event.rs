use {
	crate::{Level, Output, Pending},
	strata_database::BulkWriteOutput,
	strata_error as se,
};

/// Progress of a denormalization run.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Event {
	/// A cycle measured the pending resources.
	Cycle { cycle: u64, pending: Pending },

	/// A unit is about to write its updates.
	Write {
		level: Level,
		page: u64,
		requests: u64,
	},

	/// A unit's bulk write returned. The output may carry per operation write errors.
	Written {
		level: Level,
		page: u64,
		output: BulkWriteOutput,
	},

	/// A unit failed. Its resources remain pending.
	Failed {
		level: Level,
		page: u64,
		error: se::Error,
	},

	Finished { output: Output },
}
