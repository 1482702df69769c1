pub mod features;
pub mod normalizer;
pub mod progress;
pub mod ratchet;
pub mod raw_score;
pub mod symbols;
