//! Engine event notification.

pub mod bus;
