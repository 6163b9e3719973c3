//! Typed request/reply containers and RPC status shared by the engine and the
//! transport.
use std::fmt;

use serde::{Deserialize, Serialize};

/// An RPC method served by the greeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Greeting,
    Farewell,
}

impl Method {
    pub const ALL: [Method; 2] = [Method::Greeting, Method::Farewell];

    /// Name of the method on the wire.
    pub const fn path(&self) -> &'static str {
        match self {
            Method::Greeting => "SayHello",
            Method::Farewell => "SayGoodbye",
        }
    }

    pub fn from_path(path: &str) -> Option<Method> {
        Self::ALL.into_iter().find(|m| m.path() == path)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoodbyeRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodbyeReply {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Greeting(HelloRequest),
    Farewell(GoodbyeRequest),
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Greeting(_) => Method::Greeting,
            Request::Farewell(_) => Method::Farewell,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Greeting(HelloReply),
    Farewell(GoodbyeReply),
}

impl Reply {
    pub fn method(&self) -> Method {
        match self {
            Reply::Greeting(_) => Method::Greeting,
            Reply::Farewell(_) => Method::Farewell,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Reply::Greeting(r) => &r.message,
            Reply::Farewell(r) => &r.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Ok,
    InvalidArgument,
    Unimplemented,
    Internal,
    Unavailable,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Code::Ok => "ok",
            Code::InvalidArgument => "invalid_argument",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Non-success outcome of a call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_paths() {
        for method in Method::ALL {
            assert_eq!(Method::from_path(method.path()), Some(method));
        }
        assert_eq!(Method::Greeting.to_string(), "SayHello");
        assert_eq!(Method::from_path("SayHi"), None);
    }

    #[test]
    fn request_rejects_unknown_fields() {
        let ok: HelloRequest = serde_json::from_str(r#"{"name":"World"}"#).unwrap();
        assert_eq!(ok.name, "World");
        assert!(serde_json::from_str::<HelloRequest>(r#"{"name":"a","age":3}"#).is_err());
        assert!(serde_json::from_str::<GoodbyeRequest>(r#"{}"#).is_err());
    }

    #[test]
    fn status_display() {
        let status = Status::unimplemented("no such method: SayHi");
        assert_eq!(status.to_string(), "unimplemented: no such method: SayHi");
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"unimplemented\""));
    }
}
