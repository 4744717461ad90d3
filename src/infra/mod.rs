pub mod google_books;
pub mod json_store;
pub mod memory_store;
pub mod rate_limited;
pub mod sqlite_store;
