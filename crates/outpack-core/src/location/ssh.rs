use anyhow::Result;
use outpack_domain::{OutpackError, SshArgs, SshTarget};
use tracing::debug;

use super::LocationDriver;

/// SSH locations are configurable but this build carries no SSH transport.
pub(super) fn open(name: &str, args: &SshArgs) -> Result<Box<dyn LocationDriver>> {
    let target = SshTarget::parse(&args.url).map_err(|reason| OutpackError::InvalidLocation {
        name: name.to_string(),
        reason,
    })?;
    debug!(
        location = name,
        host = %target.host,
        port = target.port,
        path = %target.path,
        "ssh location requested"
    );
    Err(OutpackError::UnsupportedTransport(format!("ssh ({})", args.url)).into())
}
