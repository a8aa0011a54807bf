mod categories;
mod digests;
mod fetch_runs;
mod items;
mod policies;
mod schema;
mod search;
mod sources;
mod types;

pub use schema::Database;
pub use types::{
    Category, DailyDigest, DatabaseError, DigestItemRef, EntityCount, EntityKind, ExtractionParams,
    FetchRun, InsightParams, Item, NewSource, NormalizedItem, ParseKindError, Policy, PolicyParams,
    PolicyScope, RecommendationParams, Schedule, Source, SourceKind, SourceUpdate, SummaryParams,
    KNOWN_FOCUS_AREAS,
};
