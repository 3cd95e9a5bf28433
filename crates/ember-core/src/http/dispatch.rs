// src/http/dispatch.rs
//! Maps a parsed request onto the page that answers it.
//!
//! The last path segment's first byte selects a logical endpoint. Login and
//! register actions consult the credential store and redirect to a result
//! page; everything else is served straight from the resource root.

use crate::credentials::{CredentialStore, FormCredentials};
use crate::http::request::{Method, Request};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A fixed page regardless of the URL.
    Page(&'static str),
    Login,
    Register,
    /// The URL itself names the file.
    Static,
}

pub fn classify(method: Method, url: &str) -> Endpoint {
    let segment = url.rsplit('/').next().unwrap_or("");
    match (method, segment.as_bytes().first()) {
        (Method::Post, Some(b'2')) => Endpoint::Login,
        (Method::Post, Some(b'3')) => Endpoint::Register,
        (_, Some(b'0')) => Endpoint::Page("/register.html"),
        (_, Some(b'1')) => Endpoint::Page("/log.html"),
        (_, Some(b'5')) => Endpoint::Page("/picture.html"),
        (_, Some(b'6')) => Endpoint::Page("/video.html"),
        (_, Some(b'7')) => Endpoint::Page("/fans.html"),
        _ => Endpoint::Static,
    }
}

/// URL of the file that answers `request`. May block on the credential store.
pub fn target_url(request: &Request, credentials: &dyn CredentialStore) -> String {
    match classify(request.method, &request.url) {
        Endpoint::Page(page) => page.to_string(),
        Endpoint::Static => request.url.clone(),
        Endpoint::Login => login(&request.body, credentials).to_string(),
        Endpoint::Register => register(&request.body, credentials).to_string(),
    }
}

fn login(body: &[u8], credentials: &dyn CredentialStore) -> &'static str {
    let form = match FormCredentials::from_body(body) {
        Ok(form) => form,
        Err(e) => {
            debug!("Rejecting login: {}", e);
            return "/logError.html";
        }
    };
    match credentials.verify(&form.user, &form.password) {
        Ok(true) => "/welcome.html",
        Ok(false) => "/logError.html",
        Err(e) => {
            warn!("Credential lookup for {:?} failed: {}", form.user, e);
            "/logError.html"
        }
    }
}

fn register(body: &[u8], credentials: &dyn CredentialStore) -> &'static str {
    let form = match FormCredentials::from_body(body) {
        Ok(form) => form,
        Err(e) => {
            debug!("Rejecting registration: {}", e);
            return "/registerError.html";
        }
    };
    match credentials.insert(&form.user, &form.password) {
        Ok(true) => "/log.html",
        Ok(false) => "/registerError.html",
        Err(e) => {
            warn!("Registering {:?} failed: {}", form.user, e);
            "/registerError.html"
        }
    }
}
