//! The event-driven I/O and transport core: timer wheel, EventLoop,
//! pluggable ConnectionManagers (TCP, raw Ethernet, LWIP), and the
//! SecureChannel + PubSub wire layers built on top of them.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod connection;
pub mod eventloop;
pub mod ordered_tree;
pub mod timer;

pub mod cm_eth;
pub mod cm_lwip;
pub mod cm_tcp;

pub mod pubsub;
pub mod securechannel;

pub use transport_support as support;