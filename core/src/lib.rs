pub mod error;
pub mod hashid;
pub mod messages;
pub mod model;
pub mod url;
