pub mod day;
pub mod features;
pub mod job;
