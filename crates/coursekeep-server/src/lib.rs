pub mod handlers;
pub mod response;
pub mod server;

pub use response::{ApiError, ApiResponse};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
