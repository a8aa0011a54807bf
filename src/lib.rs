//! News intelligence: ingest RSS, GitHub and HTML sources into SQLite and
//! digest them with an LLM.

pub mod analysis;
pub mod config;
pub mod ingest;
pub mod storage;
pub mod util;
