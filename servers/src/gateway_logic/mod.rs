pub mod backends;
pub mod downstream;
