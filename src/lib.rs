//! FLUTE receiver: File Delivery over Unidirectional Transport, receiver
//! side only.
//!
//! Senders split files into numbered encoding symbols and broadcast them over
//! a lossy, one-way channel (multicast UDP or a replayed capture) with no
//! feedback. This crate reconstructs byte-exact objects from whatever subset
//! of symbols arrives, in any order and with duplicates, and learns what is
//! being delivered from the in-band File Delivery Table (FDT).
//!
//! Socket handling stays outside: the application reads datagrams and feeds
//! them to a [`receiver::MultiReceiver`], which demultiplexes sessions by
//! TSI and hands completed objects to an
//! [`ObjectWriter`](receiver::writer::ObjectWriter).
//!
//! ```no_run
//! use flute_rx::core::UDPEndpoint;
//! use flute_rx::receiver::{writer, Config, MultiReceiver};
//! use std::rc::Rc;
//! use std::time::SystemTime;
//!
//! let endpoint = UDPEndpoint::new(None, "224.0.0.1".to_owned(), 3400);
//! let writer = Rc::new(writer::ObjectWriterBufferBuilder::new(true));
//! let mut receiver = MultiReceiver::new(writer.clone(), Some(Config::default()), false);
//!
//! let socket = std::net::UdpSocket::bind("224.0.0.1:3400").unwrap();
//! let mut buf = vec![0u8; 2048];
//! loop {
//!     let (n, _src) = socket.recv_from(&mut buf).unwrap();
//!     let now = SystemTime::now();
//!     if let Err(e) = receiver.push(&endpoint, &buf[..n], now) {
//!         log::warn!("packet dropped: {:?}", e);
//!     }
//!     receiver.cleanup(now);
//! }
//! ```

pub mod common;
pub mod receiver;
mod tools;

/// Error types.
pub mod error {
    pub use crate::tools::error::{FluteError, Result};
}

/// Core types shared with the enclosing application.
pub mod core {
    pub use crate::common::udpendpoint::UDPEndpoint;
}
