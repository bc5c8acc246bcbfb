//! Command line front-end of the image loader.
//!
//! `imageloader fetch` runs a single load through the full pipeline, including the caches, and
//! prints where the image came from. `imageloader cleanup` prunes the disk cache.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
