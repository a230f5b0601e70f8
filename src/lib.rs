//! CANopen application-layer stack for a single node: Object Dictionary,
//! Network Management (NMT) finite-state automaton and SDO server, bound to a
//! CAN controller through the narrow [`frame::CanInterface`] port.
//!
//! The stack is cooperative: every state machine is driven by its owner
//! calling [`canopen::Canopen::poll`] (or the per-component `poll` methods)
//! from a single context. Received frames and local API calls are merged into
//! bounded per-component queues and processed in strict FIFO order.

#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]

extern crate alloc;

pub mod canopen;
pub mod cmd_header;
pub mod data_type;
pub mod error;
pub mod frame;
pub mod nmt;
pub mod od;
pub mod sdo_server;
pub mod util;

mod prelude;

pub use crate::canopen::{Canopen, CanopenConfig};
pub use crate::error::{AbortCode, ErrorCode};
pub use crate::frame::{CanFilter, CanFrame, CanInterface, TxCompletion};
pub use crate::nmt::{Nmt, NmtState};
pub use crate::od::{Od, OdBuilder, OdHandle};
pub use crate::sdo_server::SdoServer;

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        let value_str = alloc::format!($($arg)*);
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            log::info!("[canopen] {}", value_str);
        }
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            defmt::info!("[canopen] {}", defmt::Debug2Format(&value_str));
        }
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        let value_str = alloc::format!($($arg)*);
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            log::debug!("[canopen] {}", value_str);
        }
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            defmt::debug!("[canopen] {}", defmt::Debug2Format(&value_str));
        }
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        let value_str = alloc::format!($($arg)*);
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            log::warn!("[canopen] {}", value_str);
        }
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            defmt::warn!("[canopen] {}", defmt::Debug2Format(&value_str));
        }
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        let value_str = alloc::format!($($arg)*);
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            log::error!("[canopen] {}", value_str);
        }
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            defmt::error!("[canopen] {}", defmt::Debug2Format(&value_str));
        }
    };
}
