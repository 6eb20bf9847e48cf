pub mod advertise;
pub mod browser;
pub mod correlate;
pub mod records;
pub mod resolver;
pub mod source;
