use crate::proto::{
    GoodbyeReply, GoodbyeRequest, HelloReply, HelloRequest, Reply, Request, Status,
};

pub const GREETING_PREFIX: &str = "Hello ";
pub const FAREWELL_PREFIX: &str = "Goodbye ";

pub type GreetingRule = fn(&HelloRequest) -> Result<HelloReply, Status>;
pub type FarewellRule = fn(&GoodbyeRequest) -> Result<GoodbyeReply, Status>;

/// Business rules, one per method.
#[derive(Clone, Copy)]
pub struct Handlers {
    pub greeting: GreetingRule,
    pub farewell: FarewellRule,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            greeting: greet,
            farewell,
        }
    }
}

impl Handlers {
    pub fn handle(&self, request: &Request) -> Result<Reply, Status> {
        match request {
            Request::Greeting(req) => (self.greeting)(req).map(Reply::Greeting),
            Request::Farewell(req) => (self.farewell)(req).map(Reply::Farewell),
        }
    }
}

pub fn greet(request: &HelloRequest) -> Result<HelloReply, Status> {
    Ok(HelloReply {
        message: format!("{GREETING_PREFIX}{}", request.name),
    })
}

pub fn farewell(request: &GoodbyeRequest) -> Result<GoodbyeReply, Status> {
    Ok(GoodbyeReply {
        message: format!("{FAREWELL_PREFIX}{}", request.name),
    })
}
