pub mod dispatcher;
pub mod hooks;
pub mod runtime;
pub mod server;

pub use dispatcher::RequestDispatcher;
pub use hooks::{DispatchHook, DispatchOutcome, MetricsHook};
pub use runtime::GatewayRuntime;
pub use server::{build_router, serve, AppState};
