pub mod helpers;
pub mod usage;
