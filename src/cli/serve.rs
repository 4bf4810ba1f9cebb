// CLI serve command

use std::path::Path;

use crate::daemon;

/// avatar-forge serve
pub async fn cmd_serve(
    host: &str,
    port: u16,
    config: Option<&Path>,
    listen_port: Option<u16>,
    data_dir: Option<&Path>,
    verbose: bool,
) -> anyhow::Result<()> {
    // Global --host/--port only override the config when changed from their defaults.
    let host_override = (host != "127.0.0.1").then_some(host);
    let port_override = listen_port.or((port != 8000).then_some(port));
    daemon::start_service(config, data_dir, host_override, port_override, verbose).await
}
