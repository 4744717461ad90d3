pub mod cover_cache;
pub mod enrich_use_case;
pub mod ports;
pub mod resolver;
