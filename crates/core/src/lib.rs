pub mod credentials;
pub mod models;
pub mod prompt;
pub mod repository;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod tools;
pub mod writer;
