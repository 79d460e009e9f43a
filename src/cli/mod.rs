use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod errors;
mod handlers;
mod validation;

pub use handlers::*;

#[derive(Parser, Debug)]
#[command(version, about = "Visual product matcher", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring stored embeddings in line with the product image directory
    Reconcile {
        /// Print the report as JSON
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Rank catalog products by visual similarity to an image
    Search {
        /// Query image (JPEG or PNG)
        image: PathBuf,

        /// Only show matches at or above this similarity
        #[clap(short, long)]
        threshold: Option<f32>,

        /// Show at most this many matches
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Upload a product image; its embedding is computed by the next reconcile
    Add {
        /// Image file (JPEG or PNG, at most 5 MiB)
        file: PathBuf,
    },

    /// Change a product's name or category
    Edit {
        id: u64,

        #[clap(short, long)]
        name: Option<String>,

        #[clap(short, long)]
        category: Option<String>,
    },

    /// Delete a product and its image
    Delete {
        id: u64,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// List catalog products
    List {},

    /// Remove stale query uploads from the configured uploads directory.
    /// vpm never writes there itself; whatever stores query images does.
    Cleanup {},
}

impl Command {
    /// Commands that change the catalog or the image directories.
    pub fn writes_catalog(&self) -> bool {
        !matches!(self, Command::Search { .. } | Command::List {})
    }
}
