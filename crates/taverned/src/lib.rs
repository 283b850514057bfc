//! taverned: Tavern host daemon and `join` client.

pub mod admission;
pub mod host;
pub mod join;
pub mod listener;

pub use host::Host;
pub use listener::HostListener;
