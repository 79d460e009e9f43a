use clap::Parser;

mod app;
mod catalog;
mod cleanup;
mod cli;
mod config;
mod images;
mod lock;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;

use app::AppFactory;

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    // stdout carries command output, logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let paths = AppFactory::get_paths()?;
    let app = if args.command.writes_catalog() {
        AppFactory::create_local_app(&paths)?
    } else {
        AppFactory::create_read_only_app(&paths)?
    };

    match args.command {
        cli::Command::Reconcile { json } => cli::handle_reconcile(&app, json),

        cli::Command::Search {
            image,
            threshold,
            limit,
        } => cli::handle_search(&app, image, threshold, limit),

        cli::Command::Add { file } => cli::handle_add(&app, file),

        cli::Command::Edit { id, name, category } => cli::handle_edit(&app, id, name, category),

        cli::Command::Delete { id, yes } => cli::handle_delete(&app, id, yes),

        cli::Command::List {} => cli::handle_list(&app),

        cli::Command::Cleanup {} => cli::handle_cleanup(&app),
    }
}
