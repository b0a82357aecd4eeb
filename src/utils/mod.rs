pub mod clock;
pub mod precision;
