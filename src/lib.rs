pub mod db;
pub mod delivery;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod limits;
pub mod state;
pub mod submissions;
pub mod types;
