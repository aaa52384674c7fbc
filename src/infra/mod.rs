pub mod docker;
pub mod mock;
pub mod reconciler;
pub mod secrets;
pub mod store;
pub mod web;
