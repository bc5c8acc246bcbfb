mod caching;
mod dedup;
mod failures;
mod local;
mod utils;
