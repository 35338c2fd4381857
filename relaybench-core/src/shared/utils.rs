use std::env;
use std::sync::Arc;

const ENV_HOSTNAME: &str = "HOSTNAME";
const DEFAULT_HOST: &str = "localhost";

/// Resolves the host name stamped on generated records and compared by the Sink. An explicit
/// override wins, then `HOSTNAME`, then `localhost`. `HOSTNAME` is only seen when it is exported,
/// which interactive shells usually do not do, so a launcher that needs the machine name must pass
/// it as the override.
pub(crate) fn resolve_host(host_override: Option<&str>) -> Arc<str> {
    resolve_host_from(host_override, env::var(ENV_HOSTNAME).ok())
}

fn resolve_host_from(host_override: Option<&str>, env_host: Option<String>) -> Arc<str> {
    if let Some(host) = host_override.map(str::trim).filter(|h| !h.is_empty()) {
        return Arc::from(host);
    }
    match env_host {
        Some(host) if !host.trim().is_empty() => Arc::from(host.trim()),
        _ => Arc::from(DEFAULT_HOST),
    }
}
