//! A user-space USB/IP server that impersonates USB devices.
//!
//! A kernel-side USB/IP client attaches to the server over TCP and sees the
//! configured [`VirtualDevice`]s as locally connected peripherals. Standard
//! control transfers are answered from the in-memory descriptor tree;
//! everything else is routed to a user-supplied [`UsbDeviceHandler`], which
//! is where the device behavior under test lives.

pub mod attach;
pub mod controller;
pub mod descriptors;
pub mod error;
pub mod server;
pub mod usb;
pub mod usbip;

pub use attach::{Attacher, NullAttacher, UsbIpTool};
pub use controller::{
    NullHandler, UsbDeviceHandler, VirtualController, VirtualDevice, VirtualDeviceBuilder,
};
pub use descriptors::{Configuration, Device, Interface};
pub use error::{Error, Result};
pub use server::UsbIpServer;
