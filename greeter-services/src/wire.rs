//! Request and response frames as they travel on the wire, and their
//! conversion to the typed containers.
use greeter_core::proto::{
    GoodbyeReply, GoodbyeRequest, HelloReply, HelloRequest, Method, Reply, Request, Status,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub body: Value,
}

impl RequestFrame {
    pub fn new(id: u64, request: &Request) -> Result<Self, serde_json::Error> {
        let body = match request {
            Request::Greeting(req) => serde_json::to_value(req)?,
            Request::Farewell(req) => serde_json::to_value(req)?,
        };
        Ok(Self {
            id,
            method: request.method().path().to_string(),
            body,
        })
    }

    /// Resolve the method and decode the body into its request container.
    pub fn into_request(self) -> Result<Request, Status> {
        let method = Method::from_path(&self.method)
            .ok_or_else(|| Status::unimplemented(format!("unknown method {}", self.method)))?;
        let invalid = |e: serde_json::Error| Status::invalid_argument(format!("{method}: {e}"));
        match method {
            Method::Greeting => serde_json::from_value::<HelloRequest>(self.body)
                .map(Request::Greeting)
                .map_err(invalid),
            Method::Farewell => serde_json::from_value::<GoodbyeRequest>(self.body)
                .map(Request::Farewell)
                .map_err(invalid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ResponseFrame {
    pub fn error(id: u64, status: Status) -> Self {
        Self {
            id,
            status,
            body: None,
        }
    }

    pub fn from_result(id: u64, result: Result<Reply, Status>) -> Self {
        let body = result.and_then(|reply| {
            match &reply {
                Reply::Greeting(r) => serde_json::to_value(r),
                Reply::Farewell(r) => serde_json::to_value(r),
            }
            .map_err(|e| Status::internal(format!("encode reply: {e}")))
        });
        match body {
            Ok(body) => Self {
                id,
                status: Status::ok(),
                body: Some(body),
            },
            Err(status) => Self::error(id, status),
        }
    }

    /// Decode the reply of a `method` call.
    pub fn into_reply(self, method: Method) -> Result<Reply, Status> {
        if !self.status.is_ok() {
            return Err(self.status);
        }
        let body = self
            .body
            .ok_or_else(|| Status::internal("response without body"))?;
        let invalid = |e: serde_json::Error| Status::internal(format!("decode reply: {e}"));
        match method {
            Method::Greeting => serde_json::from_value::<HelloReply>(body)
                .map(Reply::Greeting)
                .map_err(invalid),
            Method::Farewell => serde_json::from_value::<GoodbyeReply>(body)
                .map(Reply::Farewell)
                .map_err(invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use greeter_core::proto::Code;
    use serde_json::json;

    use super::*;

    fn frame(method: &str, body: Value) -> RequestFrame {
        RequestFrame {
            id: 1,
            method: method.to_string(),
            body,
        }
    }

    #[test]
    fn known_methods() {
        assert_eq!(
            frame("SayHello", json!({"name": "World"})).into_request(),
            Ok(Request::Greeting(HelloRequest {
                name: "World".into()
            }))
        );
        assert_eq!(
            frame("SayGoodbye", json!({"name": ""})).into_request(),
            Ok(Request::Farewell(GoodbyeRequest { name: "".into() }))
        );
    }

    #[test]
    fn unknown_method_is_unimplemented() {
        let status = frame("SayHi", json!({"name": "x"}))
            .into_request()
            .unwrap_err();
        assert_eq!(status.code, Code::Unimplemented);
    }

    #[test]
    fn mismatched_body_is_invalid_argument() {
        for body in [json!({"nom": "x"}), json!(42), Value::Null, json!({"name": 3})] {
            let status = frame("SayHello", body).into_request().unwrap_err();
            assert_eq!(status.code, Code::InvalidArgument);
        }
    }

    #[test]
    fn reply_frames() {
        let ok = ResponseFrame::from_result(
            3,
            Ok(Reply::Farewell(GoodbyeReply {
                message: "Goodbye World".into(),
            })),
        );
        assert!(ok.status.is_ok());
        assert_eq!(
            ok.into_reply(Method::Farewell).unwrap().message(),
            "Goodbye World"
        );

        let failed = ResponseFrame::from_result(4, Err(Status::unavailable("stopping")));
        assert_eq!(failed.body, None);
        assert_eq!(
            failed.into_reply(Method::Greeting),
            Err(Status::unavailable("stopping"))
        );
    }

    #[test]
    fn request_frame_from_typed_request() {
        let request = Request::Greeting(HelloRequest {
            name: "World".into(),
        });
        let frame = RequestFrame::new(9, &request).unwrap();
        assert_eq!(frame.method, "SayHello");
        assert_eq!(frame.body, json!({"name": "World"}));
        assert_eq!(frame.into_request(), Ok(request));
    }
}
