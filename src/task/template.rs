//! Command line templating.
//!
//! Two placeholders are recognized:
//! - `%shard_id%` becomes the decimal shard id
//! - `%port:<name>%` becomes a port leased for `<name>`; every occurrence of
//!   the same name within one template shares a single lease

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::PortLeaseError;
use crate::ports::PortLeaser;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%(?:port:(?P<port>\w+)|(?P<shard>shard_id))%")
        .expect("placeholder pattern is valid")
});

/// Result of expanding a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedCommand {
    pub command: String,
    /// Symbolic port name -> leased port, one entry per distinct name
    pub ports: HashMap<String, u16>,
}

impl ExpandedCommand {
    pub fn port(&self, name: &str) -> Option<u16> {
        self.ports.get(name).copied()
    }
}

/// Expand `template` for `shard_id`, leasing ports from `leaser`.
///
/// If the pool runs dry part way through, every port leased by this call is
/// released before the error is returned.
pub fn expand(
    template: &str,
    shard_id: u32,
    leaser: &dyn PortLeaser,
) -> Result<ExpandedCommand, PortLeaseError> {
    let mut command = String::with_capacity(template.len());
    let mut ports: HashMap<String, u16> = HashMap::new();
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        command.push_str(&template[last..whole.start()]);
        last = whole.end();

        if caps.name("shard").is_some() {
            command.push_str(&shard_id.to_string());
            continue;
        }

        let Some(name) = caps.name("port").map(|m| m.as_str()) else {
            continue;
        };
        let port = match ports.get(name) {
            Some(port) => *port,
            None => match leaser.lease() {
                Ok(port) => {
                    ports.insert(name.to_string(), port);
                    port
                }
                Err(e) => {
                    tracing::warn!(
                        port_name = name,
                        partial = ports.len(),
                        "Port lease failed during expansion, releasing partial leases"
                    );
                    for port in ports.values() {
                        leaser.release(*port);
                    }
                    return Err(e);
                }
            },
        };
        command.push_str(&port.to_string());
    }
    command.push_str(&template[last..]);

    Ok(ExpandedCommand { command, ports })
}
