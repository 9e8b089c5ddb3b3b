pub mod demo;
pub mod provision;
pub mod r#pub;
pub mod sub;
