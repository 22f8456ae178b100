use clap::Subcommand;

use super::keys::{JwksArgs, VerifyArgs};
use super::serve::ServeArgs;

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Run the control server (HTTP, SSE and agent WebSocket)
    Serve(ServeArgs),

    /// Print the public key set of the configured signing key
    Jwks(JwksArgs),

    /// Verify a compact JWS envelope against a published key set
    Verify(VerifyArgs),
}
