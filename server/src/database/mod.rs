// Database access: connection handling, structure installer and user storage

pub mod connection;
pub mod structure;
pub mod users;
