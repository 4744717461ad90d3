/// Defaults shared by the config layer, the resolver and the scheduler.
/// Keep these in one place so the CLI, tests and docs agree.

// External lookup service
pub const GOOGLE_BOOKS_VOLUMES_URL: &str = "https://www.googleapis.com/books/v1/volumes";
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_MAX_RESULTS: u32 = 1;
pub const DEFAULT_PRINT_TYPE: &str = "books";

// Resolver
pub const DEFAULT_RETRY_DELAY_MS: u64 = 600;
pub const MIN_SCANNED_CODE_LEN: usize = 10;
pub const EXACT_IDENTIFIER_PREFIX: &str = "isbn:";

// Cover cache
pub const DEFAULT_CACHE_PATH: &str = "data/cover_cache.json";
pub const DEFAULT_NEGATIVE_TTL_HOURS: i64 = 24;

// Scheduler
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
pub const DEFAULT_MIN_REQUEST_GAP_MS: u64 = 140;

// Identifier type tags in lookup responses
pub const IDENTIFIER_TYPE_ISBN_10: &str = "ISBN_10";
pub const IDENTIFIER_TYPE_ISBN_13: &str = "ISBN_13";
