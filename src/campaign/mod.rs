//! Job Generator.
//!
//! A campaign is every job produced from one bot roster, one map roster and
//! a repeat count. The producer mints every job id up front, so ids are
//! unique without any coordination between workers.
//!
//! - [`roster`]: roster files and asset existence checks
//! - [`generator`]: all-vs-all and one-vs-all expansion
//! - [`producer`]: preconditions and the publish step

pub mod generator;
pub mod producer;
pub mod roster;

pub use generator::{CampaignConfig, Policy, DEFAULT_REPEAT_GAMES};
pub use producer::{publish_campaign, CampaignReport};
pub use roster::{dedup, read_lines, AssetDirs};
