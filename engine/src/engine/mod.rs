pub mod dispatcher;
mod orders;
pub mod strategy;
mod window;
