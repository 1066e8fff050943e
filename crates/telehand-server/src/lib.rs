//! telehand HTTP surfaces.
//!
//! Two servers share one status hub: the control API (all interfaces,
//! reachable over the virtual IP) and the status/GUI server (loopback).

pub mod api;
pub mod error;
pub mod gui;

use std::sync::atomic::{AtomicU16, Ordering};

pub use api::ApiServer;
pub use error::{ServerError, ServerResult};
pub use gui::GuiServer;

/// Ports the two servers actually bound, for `/health`.
#[derive(Debug, Default)]
pub struct Ports {
    api: AtomicU16,
    gui: AtomicU16,
}

impl Ports {
    pub fn api(&self) -> u16 {
        self.api.load(Ordering::Relaxed)
    }

    pub fn gui(&self) -> u16 {
        self.gui.load(Ordering::Relaxed)
    }

    pub(crate) fn set_api(&self, port: u16) {
        self.api.store(port, Ordering::Relaxed);
    }

    pub(crate) fn set_gui(&self, port: u16) {
        self.gui.store(port, Ordering::Relaxed);
    }
}
