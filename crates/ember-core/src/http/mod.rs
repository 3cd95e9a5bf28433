// src/http/mod.rs
pub mod conn;
pub mod dispatch;
pub mod parser;
pub mod request;
pub mod response;

pub use conn::{Conn, Phase, WriteProgress};
pub use parser::{ParseError, Progress, RequestParser};
pub use request::{Method, Request, Version};
pub use response::Status;
