//! Applies a bound lease to the interface.

use std::{io, process::Command};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssignError {
    #[error("Failed to run `{program}`")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("`ip addr add {cidr} dev {interface}` exited with {status}: {stderr}")]
    Rejected {
        interface: String,
        cidr: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Address assignment did not run to completion")]
    Aborted(#[source] tokio::task::JoinError),
}

/// Assigns an address in CIDR notation (`a.b.c.d/len`) to an interface.
///
/// `apply` may block; the client calls it from the blocking pool.
pub trait AddressAssigner: Send + Sync {
    fn apply(&self, interface: &str, cidr: &str) -> Result<(), AssignError>;
}

/// Configures the interface through iproute2.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigurator;

impl NetworkConfigurator {
    pub fn new() -> Self {
        Self
    }
}

impl AddressAssigner for NetworkConfigurator {
    fn apply(&self, interface: &str, cidr: &str) -> Result<(), AssignError> {
        let output = Command::new("ip")
            .args(["addr", "add", cidr, "dev", interface])
            .output()
            .map_err(|source| AssignError::Spawn {
                program: "ip",
                source,
            })?;

        if !output.status.success() {
            return Err(AssignError::Rejected {
                interface: interface.to_string(),
                cidr: cidr.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::info!("Set {} to {}", interface, cidr);
        Ok(())
    }
}
