//! Jobs Worker Service - Entry Point
//!
//! Moves jobs from the Redis queue into PostgreSQL.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jobs_worker::run().await
}
