pub mod aggregation;
pub mod delivery;
pub mod episodes;
pub mod jobs;
pub mod mqtt;
pub mod notifications;
