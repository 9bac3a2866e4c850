//! Ids shared by the hub and by out-of-process producers.

pub mod id;
pub mod snowflake;

pub use snowflake::SnowflakeGenerator;
