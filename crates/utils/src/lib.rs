pub mod log_msg;
pub mod msg_store;
pub mod path;
pub mod text;
