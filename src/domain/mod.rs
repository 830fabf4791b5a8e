pub mod models;
pub mod window;
