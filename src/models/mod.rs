pub mod chat;
pub mod request;
