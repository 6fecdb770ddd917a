pub mod command;
pub mod logging;
pub mod path_resolver;
pub mod validation;
