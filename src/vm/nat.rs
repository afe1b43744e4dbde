//! NAT port-forward rules and their `--natpf1` argument form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Exposes a guest TCP port on a host port through the VM's NAT adapter.
///
/// Ports are kept as strings and passed to VirtualBox untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub guest_port: String,
    pub host_port: String,
}

impl NatRule {
    pub fn new(guest_port: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            guest_port: guest_port.into(),
            host_port: host_port.into(),
        }
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.guest_port)
    }
}

/// Parses the `HOST:GUEST` form used on the command line.
impl FromStr for NatRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, guest) = s
            .split_once(':')
            .ok_or_else(|| format!("expected HOST:GUEST, got {s:?}"))?;
        let (host, guest) = (host.trim(), guest.trim());
        if host.is_empty() || guest.is_empty() {
            return Err(format!("expected HOST:GUEST, got {s:?}"));
        }
        Ok(Self::new(guest, host))
    }
}

/// Render one rule as a VirtualBox `--natpf1` value:
///
/// ```text
/// <name>,tcp,<host ip>,<host port>,<guest ip>,<guest port>
/// ```
///
/// Both IPs are left empty. The rule name embeds `index` so two rules for the
/// same guest port do not collide.
pub fn natpf_rule(rule: &NatRule, index: usize) -> String {
    format!(
        "guest{guest}_{index},tcp,,{host},,{guest}",
        guest = rule.guest_port,
        host = rule.host_port,
    )
}
