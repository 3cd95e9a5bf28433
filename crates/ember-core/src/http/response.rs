// src/http/response.rs
use crate::buffer::ByteBuffer;
use crate::error::EmberResult;
use crate::http::request::Version;

/// Body sent for a resource that exists but is zero bytes long.
pub const EMPTY_PAGE: &[u8] = b"<html><body></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed explanatory body for error statuses.
    pub fn form(self) -> &'static str {
        match self {
            Status::Ok => "",
            Status::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Status::Forbidden => "You do not have permission to get the file from this server.\n",
            Status::NotFound => "The requested file was not found on this server.\n",
            Status::InternalError => "There was an unusual problem serving the requested file.\n",
        }
    }

    /// Statuses after which the connection is always dropped.
    pub fn forces_close(self) -> bool {
        matches!(self, Status::BadRequest | Status::InternalError)
    }
}

/// Writes the status line and the headers, followed by the blank line.
/// Fails with `BufferFull` if the header does not fit.
pub fn write_head(
    buf: &mut ByteBuffer,
    version: Version,
    status: Status,
    content_length: usize,
    keep_alive: bool,
) -> EmberResult<()> {
    let mut code = itoa::Buffer::new();
    let mut len = itoa::Buffer::new();

    buf.append(version.as_str().as_bytes())?;
    buf.append(b" ")?;
    buf.append(code.format(status.code()).as_bytes())?;
    buf.append(b" ")?;
    buf.append(status.title().as_bytes())?;
    buf.append(b"\r\nContent-Length: ")?;
    buf.append(len.format(content_length).as_bytes())?;
    buf.append(if keep_alive {
        b"\r\nConnection: keep-alive\r\n\r\n".as_slice()
    } else {
        b"\r\nConnection: closed\r\n\r\n".as_slice()
    })?;
    Ok(())
}

/// Writes a complete response whose body lives in the write buffer.
pub fn write_inline(
    buf: &mut ByteBuffer,
    version: Version,
    status: Status,
    body: &[u8],
    keep_alive: bool,
) -> EmberResult<()> {
    write_head(buf, version, status, body.len(), keep_alive)?;
    buf.append(body)
}

/// Writes an error status with its fixed form as the body.
pub fn write_error(
    buf: &mut ByteBuffer,
    version: Version,
    status: Status,
    keep_alive: bool,
) -> EmberResult<()> {
    write_inline(buf, version, status, status.form().as_bytes(), keep_alive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmberError;

    fn text(buf: &ByteBuffer) -> &str {
        std::str::from_utf8(buf.unconsumed()).unwrap()
    }

    #[test]
    fn head_lists_length_and_connection() {
        let mut buf = ByteBuffer::with_capacity(1024);
        write_head(&mut buf, Version::Http11, Status::Ok, 1234, true).unwrap();
        assert_eq!(
            text(&buf),
            "HTTP/1.1 200 OK\r\nContent-Length: 1234\r\nConnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn error_response_carries_its_form() {
        let mut buf = ByteBuffer::with_capacity(1024);
        write_error(&mut buf, Version::Http10, Status::NotFound, false).unwrap();
        let form = Status::NotFound.form();
        let expected = format!(
            "HTTP/1.0 404 Not Found\r\nContent-Length: {}\r\nConnection: closed\r\n\r\n{}",
            form.len(),
            form
        );
        assert_eq!(text(&buf), expected);
    }

    #[test]
    fn empty_page_is_inlined() {
        let mut buf = ByteBuffer::with_capacity(1024);
        write_inline(&mut buf, Version::Http11, Status::Ok, EMPTY_PAGE, false).unwrap();
        assert!(text(&buf).ends_with("\r\n\r\n<html><body></body></html>"));
        assert!(text(&buf).contains("Content-Length: 26\r\n"));
    }

    #[test]
    fn overflowing_head_is_reported() {
        let mut buf = ByteBuffer::with_capacity(16);
        let err = write_head(&mut buf, Version::Http11, Status::Ok, 0, false).unwrap_err();
        assert!(matches!(err, EmberError::BufferFull));
    }

    #[test]
    fn only_400_and_500_force_close() {
        assert!(Status::BadRequest.forces_close());
        assert!(Status::InternalError.forces_close());
        assert!(!Status::NotFound.forces_close());
        assert!(!Status::Forbidden.forces_close());
        assert!(!Status::Ok.forces_close());
    }
}
