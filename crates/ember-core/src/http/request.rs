// src/http/request.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Method tokens are matched case-insensitively; anything else is unsupported.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if b.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// A fully parsed request. Only the headers the server acts on are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub version: Version,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
    pub body: Vec<u8>,
}

impl Request {
    pub(crate) fn new(method: Method, url: String, version: Version) -> Self {
        Self {
            method,
            url,
            version,
            host: None,
            content_length: 0,
            keep_alive: false,
            body: Vec::new(),
        }
    }
}
