pub mod cost_record;
pub mod identity;
pub mod project;
pub mod workflow;
