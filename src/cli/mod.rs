mod app;
mod commands;
mod env;
mod keys;
mod runtime;
mod serve;

pub use app::run;
pub use commands::Commands;
pub use env::CliArgs;
pub use keys::{cmd_jwks, cmd_verify, JwksArgs, VerifyArgs};
pub use runtime::{init_logging, load_signing_key};
pub use serve::{cmd_serve, ServeArgs};
