pub mod health;
pub mod push;
pub mod reset;
