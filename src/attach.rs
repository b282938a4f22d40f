//! Host-side attach collaborator. The server itself only serves the wire
//! protocol; making the local kernel actually bind a listed device is
//! delegated to an [`Attacher`], so tests can swap in a recording stub.

use std::process::Command;

use crate::error::{Error, Result};

pub trait Attacher: Send + Sync {
    /// Make a USB/IP client attach the given bus id from this server.
    fn attach(&self, bus_id: &str) -> Result<()>;

    /// Release the client-side port again.
    fn detach(&self, port: u32) -> Result<()>;
}

/// Production attacher: shells out to the platform `usbip` utility against
/// the loopback address.
pub struct UsbIpTool;

impl Attacher for UsbIpTool {
    fn attach(&self, bus_id: &str) -> Result<()> {
        // Failing to attach a valid device is fatal for the call: the user
        // may have to clean their environment up by hand.
        let output = Command::new("usbip")
            .args(["attach", "-r", "127.0.0.1", "-b", bus_id])
            .output()
            .map_err(|e| Error::Attacher(format!("failed to run usbip: {e}")))?;
        if !output.status.success() {
            let msg = format!(
                "usbip attach {bus_id} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
            log::error!("{msg}");
            return Err(Error::Attacher(msg));
        }
        log::debug!("attached {bus_id}");
        Ok(())
    }

    fn detach(&self, port: u32) -> Result<()> {
        // There are ordinary reasons for a port to refuse detaching, so a
        // non-zero exit only warns.
        let output = Command::new("usbip")
            .args(["detach", "-p", &port.to_string()])
            .output()
            .map_err(|e| Error::Attacher(format!("failed to run usbip: {e}")))?;
        if !output.status.success() {
            log::warn!(
                "usbip detach port {port} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

/// Attacher that does nothing. The default for servers that are only ever
/// driven by a remote client (or a test).
pub struct NullAttacher;

impl Attacher for NullAttacher {
    fn attach(&self, _bus_id: &str) -> Result<()> {
        Ok(())
    }

    fn detach(&self, _port: u32) -> Result<()> {
        Ok(())
    }
}
