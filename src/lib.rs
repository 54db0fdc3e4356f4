pub mod api;
pub mod config;
pub mod conversation;
pub mod formulation;
pub mod status;
