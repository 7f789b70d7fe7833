//! HTTP/1.1 protocol types and parsing.
//!
//! This module provides the core HTTP primitives:
//! [`Method`], [`StatusCode`], [`Headers`], [`Request`], [`Response`], and the
//! incremental request [`Parser`] that feeds a connection.

use std::fmt;

pub mod date;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use parser::{Event, ParseError, Parser, RequestHead};
pub use request::Request;
pub use response::{Cookie, Response};

macro_rules! status_codes {
    ($($variant:ident = $code:literal, $reason:literal;)+) => {
        /// An HTTP response status code.
        ///
        /// # Examples
        ///
        /// ```
        /// use apodo::http::StatusCode;
        ///
        /// let status = StatusCode::ServiceUnavailable;
        /// assert_eq!(status.as_u16(), 503);
        /// assert_eq!(status.canonical_reason(), "Service Unavailable");
        /// assert!(status.is_server_error());
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum StatusCode {
            $($variant = $code,)+
        }

        impl StatusCode {
            /// Looks up a status code by its numeric value.
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Reason phrase written on the status line.
            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $(Self::$variant => $reason,)+
                }
            }
        }
    };
}

status_codes! {
    Continue = 100, "Continue";
    Ok = 200, "OK";
    Created = 201, "Created";
    Accepted = 202, "Accepted";
    NoContent = 204, "No Content";
    MovedPermanently = 301, "Moved Permanently";
    Found = 302, "Found";
    NotModified = 304, "Not Modified";
    BadRequest = 400, "Bad Request";
    Unauthorized = 401, "Unauthorized";
    Forbidden = 403, "Forbidden";
    NotFound = 404, "Not Found";
    MethodNotAllowed = 405, "Method Not Allowed";
    RequestTimeout = 408, "Request Timeout";
    LengthRequired = 411, "Length Required";
    PayloadTooLarge = 413, "Payload Too Large";
    UnsupportedMediaType = 415, "Unsupported Media Type";
    RequestHeaderFieldsTooLarge = 431, "Request Header Fields Too Large";
    InternalServerError = 500, "Internal Server Error";
    NotImplemented = 501, "Not Implemented";
    ServiceUnavailable = 503, "Service Unavailable";
    HttpVersionNotSupported = 505, "HTTP Version Not Supported";
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    pub fn is_client_error(self) -> bool {
        (400..500).contains(&self.as_u16())
    }

    pub fn is_server_error(self) -> bool {
        self.as_u16() >= 500
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

macro_rules! methods {
    ($($variant:ident => $name:literal,)+) => {
        /// An HTTP request method.
        ///
        /// Names are case-insensitive and normalised to upper case, so a route
        /// declared for `"get"` answers `GET` requests. Unknown names become
        /// [`Method::Custom`] and still route by exact name.
        ///
        /// ```
        /// use apodo::http::Method;
        ///
        /// assert_eq!(Method::from("patch"), Method::Patch);
        /// assert_eq!(Method::from("purge").as_str(), "PURGE");
        /// ```
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum Method {
            $($variant,)+
            Custom(String),
        }

        impl Method {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $name,)+
                    Self::Custom(name) => name,
                }
            }
        }

        impl From<&str> for Method {
            fn from(name: &str) -> Self {
                let upper = name.to_ascii_uppercase();
                match upper.as_str() {
                    $($name => Self::$variant,)+
                    _ => Self::Custom(upper),
                }
            }
        }
    };
}

methods! {
    Get => "GET",
    Head => "HEAD",
    Post => "POST",
    Put => "PUT",
    Delete => "DELETE",
    Patch => "PATCH",
    Options => "OPTIONS",
    Connect => "CONNECT",
    Trace => "TRACE",
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_are_normalised() {
        assert_eq!(Method::from("get"), Method::Get);
        assert_eq!("Delete".parse::<Method>(), Ok(Method::Delete));
        assert_eq!(Method::from("purge"), Method::Custom("PURGE".to_owned()));
        assert_eq!(Method::Custom("PURGE".to_owned()).to_string(), "PURGE");
    }

    #[test]
    fn status_lookup_and_classes() {
        assert_eq!(StatusCode::from_u16(503), Some(StatusCode::ServiceUnavailable));
        assert_eq!(StatusCode::from_u16(299), None);
        assert_eq!(StatusCode::MethodNotAllowed.to_string(), "405 Method Not Allowed");
        assert!(StatusCode::NoContent.is_success());
        assert!(StatusCode::NotFound.is_client_error());
        assert!(!StatusCode::NotFound.is_server_error());
    }
}
