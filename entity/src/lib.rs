pub mod data;
pub mod mapping;
pub mod stream;
pub mod trading;
