//! Stateful reception: FDT tracking, object reconstruction and session
//! dispatch.

mod fdtreceiver;
mod multireceiver;
mod objectreceiver;
mod receiver;
mod uncompress;
pub mod writer;

pub use multireceiver::MultiReceiver;
pub use receiver::{CloseHandle, Config, Receiver, TOI_FDT};
