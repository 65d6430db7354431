pub mod clock;
pub mod driver;
pub mod idle;
pub mod topology;
