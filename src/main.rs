//! Docstore entry point.
//!
//! Loads configuration, builds the configured storage backend and runs a
//! lock and health probe against it.

use docstore::run;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run().await
}
