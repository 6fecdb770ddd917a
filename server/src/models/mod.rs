// Request, response and shared state types for the HTTP surface

pub mod requests;
pub mod responses;
pub mod state;
