use {crossterm::style::Stylize as _, strata_index as index};

const SEPARATOR: &str = "======================================";

pub fn event(event: &index::Event) {
	match event {
		index::Event::Cycle { cycle, pending } => {
			let [collections, groups, subgroups, leaves] = pending.levels;
			println!(
				"cycle {cycle}: {} pending ({collections} collections, {groups} groups, {subgroups} subgroups, {leaves} leaves)",
				pending.total()
			);
		},
		index::Event::Write {
			level,
			page,
			requests,
		} => {
			let level = u8::from(*level);
			println!("==============={level}-{page}-{requests}===============");
		},
		index::Event::Written { output, .. } => {
			json(output);
			println!("{SEPARATOR}");
		},
		index::Event::Failed { level, page, error } => {
			let level = u8::from(*level);
			eprintln!("{} {level}-{page} failed", "error".red().bold());
			json(error);
			println!("{SEPARATOR}");
		},
		index::Event::Finished { output } => {
			json(output);
		},
	}
}

fn json<T>(value: &T)
where
	T: serde::Serialize,
{
	match serde_json::to_string_pretty(value) {
		Ok(json) => println!("{json}"),
		Err(error) => tracing::error!(?error, "failed to serialize the output"),
	}
}
