mod store;

pub use store::create_submission;
