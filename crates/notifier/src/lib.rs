pub mod dispatcher;
pub mod email;
pub mod listener;
pub mod pg;
pub mod pool;
pub mod registry;
pub mod store;
pub mod suppression;
pub mod task_status;
