pub mod cache_key;
pub mod clothing;
pub mod record;
