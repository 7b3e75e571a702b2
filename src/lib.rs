pub mod addr;
pub mod config;
pub mod disposition;
pub mod dns;
pub mod errors;
pub mod handlers;
pub mod headers;
pub mod ipmap;
pub mod metrics;
pub mod milter;
pub mod objects;
pub mod pipeline;
pub mod server;
pub mod smtp;
pub mod symbols;
pub mod timeout;

pub use config::Config;
pub use disposition::EventResponse;
pub use errors::PipelineError;
pub use handlers::{CallbackStage, Handler, HandlerRegistry};
pub use pipeline::{ConnectionContext, Pipeline};
pub use server::run_server;
