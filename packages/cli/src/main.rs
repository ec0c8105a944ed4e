use {
	crossterm::style::Stylize as _,
	std::path::PathBuf,
	strata_database as db,
	strata_error as se,
	strata_index as index,
	time::format_description::well_known::Rfc3339,
	tracing_subscriber::prelude::*,
};

mod print;

/// Materialize the hierarchy closures of the resources in a document store.
#[derive(Clone, Debug, clap::Parser)]
#[command(name = "strata", version, about)]
struct Args {
	/// The store, as `sqlite://<path>` or a path to a SQLite database.
	#[arg(index = 1)]
	url: String,
}

struct Cli {
	args: Args,
	config: index::Config,
}

#[derive(Clone, Copy, Debug, Default)]
enum TracingFormat {
	Json,
	#[default]
	Pretty,
}

fn main() -> std::process::ExitCode {
	// Parse the args.
	let args = <Args as clap::Parser>::parse();

	// Read the config.
	let config = match Cli::read_config() {
		Ok(config) => config,
		Err(error) => {
			Cli::print_error_message("an error occurred");
			Cli::print_error(&error);
			return std::process::ExitCode::FAILURE;
		},
	};

	// Initialize tracing.
	Cli::initialize_tracing();

	// Create the tokio runtime.
	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
	{
		Ok(runtime) => runtime,
		Err(source) => {
			let error = se::error!(!source, "failed to create the tokio runtime");
			Cli::print_error_message("an error occurred");
			Cli::print_error(&error);
			return std::process::ExitCode::FAILURE;
		},
	};

	// Run.
	let cli = Cli { args, config };
	let result = runtime.block_on(cli.run());

	match result {
		Ok(output) => {
			if let index::Status::Stalled { pending } | index::Status::Exhausted { pending } =
				output.status
			{
				Cli::print_warning_message(&format!("{pending} resources remain pending"));
			}
			std::process::ExitCode::SUCCESS
		},
		Err(error) => {
			Cli::print_error_message("an error occurred");
			Cli::print_error(&error);
			std::process::ExitCode::FAILURE
		},
	}
}

impl Cli {
	async fn run(self) -> se::Result<index::Output> {
		// Open the store.
		let database = Self::open(&self.args.url).await?;

		// Create the index and print its events.
		let mut index = index::Index::new(database, self.config)?;
		let mut events = index.subscribe();
		let printer = tokio::spawn(async move {
			while let Some(event) = events.recv().await {
				print::event(&event);
			}
		});

		Self::print_timestamp("start")?;
		let result = index.denormalize().await;

		// Drop the index to close the events.
		drop(index);
		printer
			.await
			.map_err(|source| se::error!(!source, "the printer task panicked"))?;
		Self::print_timestamp("end")?;

		result
	}

	/// Open an existing store. A store that does not exist is an error.
	async fn open(url: &str) -> se::Result<db::sqlite::Database> {
		let path = Self::parse_url(url)?;
		let mut options = db::sqlite::DatabaseOptions::new(path);
		options.flags.remove(rusqlite::OpenFlags::SQLITE_OPEN_CREATE);
		let database = db::sqlite::Database::new(options)
			.await
			.map_err(|source| se::error!(!source, %url, "failed to open the store"))?;
		Ok(database)
	}

	fn read_config() -> se::Result<index::Config> {
		let Ok(json) = std::env::var("STRATA_CONFIG") else {
			return Ok(index::Config::default());
		};
		let config = serde_json::from_str(&json)
			.map_err(|source| se::error!(!source, "failed to deserialize STRATA_CONFIG"))?;
		Ok(config)
	}

	fn parse_url(url: &str) -> se::Result<PathBuf> {
		if let Some(path) = url.strip_prefix("sqlite://") {
			if path.is_empty() {
				return Err(se::error!(%url, "the url has no path"));
			}
			return Ok(path.into());
		}
		if let Some((scheme, _)) = url.split_once("://") {
			return Err(se::error!(%scheme, "unsupported scheme"));
		}
		if url.is_empty() {
			return Err(se::error!("the url is empty"));
		}
		Ok(url.into())
	}

	fn initialize_tracing() {
		let filter = std::env::var("STRATA_TRACING").ok();
		let format = match std::env::var("STRATA_TRACING_FORMAT").ok().as_deref() {
			Some("json") => TracingFormat::Json,
			_ => TracingFormat::default(),
		};
		let output_layer = filter.map(|filter| {
			let filter = tracing_subscriber::filter::EnvFilter::try_new(&filter)
				.unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info"));
			let output_layer = match format {
				TracingFormat::Json => tracing_subscriber::fmt::layer()
					.with_writer(std::io::stderr)
					.json()
					.boxed(),
				TracingFormat::Pretty => tracing_tree::HierarchicalLayer::new(2)
					.with_bracketed_fields(true)
					.with_span_retrace(true)
					.boxed(),
			};
			output_layer.with_filter(filter)
		});
		tracing_subscriber::registry().with(output_layer).init();
		std::panic::set_hook(Box::new(|info| {
			let payload = info.payload_as_str();
			let location = info.location().map(ToString::to_string);
			let backtrace = std::backtrace::Backtrace::force_capture();
			tracing::error!(payload, location, %backtrace, "panic");
		}));
	}

	fn print_timestamp(label: &str) -> se::Result<()> {
		let now = time::OffsetDateTime::now_utc()
			.format(&Rfc3339)
			.map_err(|source| se::error!(!source, "failed to format the timestamp"))?;
		println!("{label} @ = {now}");
		Ok(())
	}

	fn print_error_message(string: &str) {
		eprintln!("{} {string}", "error".red().bold());
	}

	fn print_warning_message(string: &str) {
		eprintln!("{} {string}", "warning".yellow().bold());
	}

	fn print_error(error: &se::Error) {
		for error in error.chain() {
			eprintln!("{} {}", "->".red(), error.message);
			if let Some(location) = &error.location {
				let location = location.to_string().yellow();
				eprintln!("   {location}");
			}
			for (name, value) in &error.values {
				let name = name.as_str().blue();
				let value = value.as_str().green();
				eprintln!("   {name} = {value}");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::Cli,
		pretty_assertions::assert_eq,
		std::path::PathBuf,
		strata_database::{self as db, prelude::*},
		strata_error as se,
	};

	#[test]
	fn parse_url() {
		assert_eq!(
			Cli::parse_url("sqlite:///tmp/strata.db").ok(),
			Some(PathBuf::from("/tmp/strata.db"))
		);
		assert_eq!(
			Cli::parse_url("strata.db").ok(),
			Some(PathBuf::from("strata.db"))
		);
		assert!(Cli::parse_url("mongodb://localhost/orthanc").is_err());
		assert!(Cli::parse_url("sqlite://").is_err());
		assert!(Cli::parse_url("").is_err());
	}

	#[tokio::test]
	async fn open_requires_an_existing_store() -> se::Result<()> {
		let temp = tempfile::tempdir()
			.map_err(|source| se::error!(!source, "failed to create a temporary directory"))?;
		let path = temp.path().join("strata.db");
		let url = format!("sqlite://{}", path.display());

		// A missing store is not created.
		assert!(Cli::open(&url).await.is_err());
		assert!(!path.exists());

		// An existing store opens.
		let options = db::sqlite::DatabaseOptions::new(&path);
		db::sqlite::Database::new(options)
			.await
			.map_err(|source| se::error!(!source, "failed to create the store"))?;
		let database = Cli::open(&url).await?;
		database
			.connection()
			.await
			.map_err(|source| se::error!(!source, "failed to get a database connection"))?;
		Ok(())
	}
}
