//! Opens the configured stores and logs what the merged vocabulary holds.
//!
//! Settings come from an optional `tagmerge.toml` next to the working
//! directory and `TAGMERGE_*` environment variables (see
//! [`tagmerge::context::Settings`]). `RUST_LOG` overrides the log filter.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tagmerge::context::{DatabaseContext, Settings};

fn main() -> ExitCode {
    let settings = match Settings::load("tagmerge") {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match run(&settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tagmerge failed");
            ExitCode::FAILURE
        }
    }
}

fn run(settings: &Settings) -> tagmerge::Result<()> {
    let context = DatabaseContext::open(settings)?;
    let reader = context.reader();
    let statistics = reader.statistics()?;
    info!(%statistics, "vocabulary loaded");
    for format_name in reader.get_tag_formats()? {
        let types = match reader.get_format_id(&format_name)? {
            Some(format_id) => reader.get_tag_types(format_id)?.len(),
            None => 0,
        };
        info!(format = %format_name, types, "format available");
    }
    if let Some(version) = reader.get_database_version()? {
        info!(%version, "store version");
    }
    context.close()
}
