pub mod price;
pub mod timestamp;
